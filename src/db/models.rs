use sqlx::FromRow;

/// Common columns of an entity table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DbEntityRow {
    pub id: String,
    pub data: String,
    pub last_changed: Option<i64>,
    pub last_changed_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DbPasswordRow {
    pub id: String,
    pub password: String,
}

/// One committed store or removal, as recorded in `rota_change_log`.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DbChangeRow {
    pub entity_id: String,
    pub changed_at: i64,
    pub is_delete: bool,
    /// Serialized entity; `None` for removals.
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DbPatchRow {
    pub owner_key: String,
    pub changed_at: i64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DbLockRow {
    pub lock_id: String,
    pub acquired_at: i64,
}
