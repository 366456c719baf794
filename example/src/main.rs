use std::collections::HashMap;

use tuplekv::bstore::BStore;
use tuplekv::error::CResult;
use tuplekv::nstore::{val, var, NStore};
use tuplekv::pstore::PStore;
use tuplekv::tuple::Value;
use tuplekv::{open, transactional};
use uuid::Uuid;

fn main() {
    println!("Hello, tuplekv!");

    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(run()).expect("example");

    println!("Bye~");
}

async fn run() -> CResult<()> {
    let db = open("example")?;

    // n-ary tuples with pattern queries
    let triples = NStore::new("triples", &[Value::Int(42)], 3);
    let post = Uuid::new_v4();
    transactional(&db, async |tx| {
        triples.add(tx, &[post.into(), "title".into(), "hyper.dev".into()], b"")?;
        triples.add(tx, &[post.into(), "keyword".into(), "hacker".into()], b"")
    })
    .await?;

    let bindings = transactional(&db, async |tx| {
        triples
            .query(
                tx,
                vec![
                    vec![var("subject"), val("keyword"), val("hacker")],
                    vec![var("subject"), val("title"), var("title")],
                ],
            )?
            .all()
            .await
    })
    .await?;
    for binding in &bindings {
        println!("title: {:?}", binding["title"]);
    }

    // content-addressed blobs
    let blobs = BStore::new("blobs", &[Value::Int(43)]);
    let uid = transactional(&db, async |tx| blobs.get_or_create(tx, b"lorem ipsum").await).await?;
    let blob = transactional(&db, async |tx| blobs.get(tx, uid).await).await?;
    assert_eq!(blob, b"lorem ipsum");

    // scored keyword search
    let search = PStore::new("search", &[Value::Int(44)]);
    transactional(&db, async |tx| {
        let mut counter = HashMap::new();
        counter.insert("database".to_string(), 42);
        counter.insert("okvs".to_string(), 2);
        search.index(tx, &Value::Int(0), &counter).await
    })
    .await?;
    let hits =
        transactional(&db, async |tx| search.search(tx, &["database"], 10).await).await?;
    println!("hits: {:?}", hits);

    Ok(())
}
