use criterion::{criterion_group, criterion_main, Criterion};
use roster_collab::protocol::SyncMessage;
use roster_collab::storage::{
    latest_per_id, Change, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoredDoc,
};
use roster_collab::{CollectionMirror, MemoryProvider, MirrorConfig};
use roster_core::{Document, Revision, Student};
use serde_json::Map;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn student_doc(i: usize) -> StoredDoc {
    let student = Student {
        grade: "4".to_string(),
        gender: "f".to_string(),
        init_assessment: "reading level B".to_string(),
        ..Student::named(format!("Student {i}"))
    };
    let doc = Document::from_record(&student).unwrap();
    StoredDoc::live(format!("s{i}"), Revision::first(), &doc.fields).unwrap()
}

fn bench_changes_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let docs: Vec<StoredDoc> = (0..100).map(student_doc).collect();

    c.bench_function("changes_encode_100_docs", |b| {
        b.iter(|| {
            let msg = SyncMessage::changes(black_box(peer), "students", 100, black_box(&docs)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_changes_decode(c: &mut Criterion) {
    let docs: Vec<StoredDoc> = (0..100).map(student_doc).collect();
    let encoded = SyncMessage::changes(Uuid::new_v4(), "students", 100, &docs)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("changes_decode_100_docs", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.documents().unwrap());
        })
    });
}

fn bench_latest_per_id(c: &mut Criterion) {
    let rev = Revision::first();
    let changes: Vec<Change> = (0..10_000u64)
        .map(|seq| Change {
            seq: seq + 1,
            id: format!("s{}", seq % 500),
            revision: rev.clone(),
            deleted: false,
        })
        .collect();

    c.bench_function("latest_per_id_10k_changes", |b| {
        b.iter(|| black_box(latest_per_id(black_box(&changes))))
    });
}

fn bench_memory_insert(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("memory_store_insert_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = MemoryStore::new("students");
                for i in 0..1000 {
                    store
                        .insert(Document::new().with_field("name", format!("Student {i}")))
                        .await
                        .unwrap();
                }
                black_box(store.info().await.unwrap());
            })
        })
    });
}

fn bench_rocks_write(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open("students", StoreConfig::for_testing(dir.path())).unwrap();
    let mut fields = Map::new();
    fields.insert("name".into(), "Ana".into());
    let mut current = rt
        .block_on(store.insert(Document::from_fields(fields.clone()).with_id("s1")))
        .unwrap()
        .revision;

    c.bench_function("rocks_store_write", |b| {
        b.iter(|| {
            let doc = Document::from_fields(fields.clone())
                .with_id("s1")
                .with_revision(current.clone());
            current = rt.block_on(store.write(doc)).unwrap();
        })
    });
}

fn bench_mirror_refresh(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let mirror = rt.block_on(async {
        let store = roster_collab::StoreProvider::open(provider.as_ref(), "students")
            .await
            .unwrap();
        for i in 0..500 {
            store
                .insert(Document::new().with_field("name", format!("Student {i}")))
                .await
                .unwrap();
        }
        CollectionMirror::spawn("students", provider.clone(), MirrorConfig::default())
    });

    c.bench_function("mirror_refresh_500_docs", |b| {
        b.iter(|| {
            let report = rt.block_on(mirror.refresh()).unwrap();
            black_box(report.loaded);
        })
    });
}

criterion_group!(
    benches,
    bench_changes_encode,
    bench_changes_decode,
    bench_latest_per_id,
    bench_memory_insert,
    bench_rocks_write,
    bench_mirror_refresh,
);
criterion_main!(benches);
