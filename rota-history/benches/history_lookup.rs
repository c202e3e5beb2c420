use chrono::{DateTime, TimeDelta};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use rota_history::EntityHistory;
use rota_model::{Category, Entity, EntityBody};

fn bench_lookup(c: &mut Criterion) {
    let mut history = EntityHistory::new(TimeDelta::days(1), 1024);
    let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let entities: Vec<Entity> = (0..256)
        .map(|i| {
            Entity::create(EntityBody::Category(Category {
                key: format!("c{i}"),
                name: format!("Category {i}"),
                parent: None,
            }))
        })
        .collect();
    for step in 0..64 {
        for entity in &entities {
            history
                .add_entity(entity, base + TimeDelta::seconds(step))
                .unwrap();
        }
    }

    let probe = base + TimeDelta::seconds(31);
    c.bench_function("get_last_changed_until", |b| {
        b.iter(|| {
            for entity in &entities {
                black_box(history.get_last_changed_until(&entity.id, probe));
            }
        })
    });

    c.bench_function("get_entity_memoized", |b| {
        let entry = history
            .get_last_changed_until(&entities[0].id, probe)
            .unwrap()
            .clone();
        b.iter(|| black_box(history.get_entity(&entry).unwrap()))
    });
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
