use std::str::FromStr;

use assert_unordered::assert_eq_unordered;
use bigdecimal::BigDecimal;
use rstest::rstest;
use tablefront::data_types::{Direction, Record, Value};
use tablefront::repository::interface::Error;

use crate::{record, test_context, TestContext};

fn event(tenant: &str, seq: i64) -> Record {
    record(&[
        ("tenant", Value::from(tenant)),
        ("seq", Value::Long(seq)),
        ("kind", Value::from(if seq % 2 == 0 { "click" } else { "view" })),
        (
            "amount",
            Value::Decimal(BigDecimal::from_str(&format!("{seq}.25")).unwrap()),
        ),
        ("happenedAt", Value::from(format!("2024-02-{:02}T08:30:00", seq))),
    ])
}

fn seqs(records: &[Record]) -> Vec<Value> {
    records.iter().map(|r| r["seq"].clone()).collect()
}

#[rstest]
#[tokio::test]
async fn test_fields_are_discovered(#[future] test_context: TestContext) {
    let test_context = test_context.await;
    let ctx = &test_context.context;

    let keys: Vec<&str> = ctx.fields.key_fields().map(|f| f.name.as_str()).collect();
    assert_eq!(keys, vec!["tenant", "seq"]);
    assert_eq!(
        ctx.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
        vec!["tenant", "seq", "kind", "amount", "happenedAt"]
    );
}

#[rstest]
#[tokio::test]
async fn test_composite_identifiers(#[future] test_context: TestContext) {
    let test_context = test_context.await;
    let ctx = &test_context.context;
    let repository = ctx.repository.clone();

    let records: Vec<Record> = (1..=3).map(|seq| event("acme", seq)).collect();
    repository.insert_all(&records).await.unwrap();

    // The external identifier of a record leads back to it
    for expected in &records {
        let id = ctx.identity.encode(expected).unwrap();
        let key = ctx.identity.parse(&id).unwrap();
        assert_eq!(
            key,
            record(&[
                ("tenant", expected["tenant"].clone()),
                ("seq", expected["seq"].clone())
            ])
        );
        assert_eq!(repository.find(&key).await.unwrap().as_ref(), Some(expected));
    }

    let id = ctx
        .identity
        .encode(&record(&[
            ("tenant", Value::from("other")),
            ("seq", Value::Long(1)),
        ]))
        .unwrap();
    let key = ctx.identity.parse(&id).unwrap();
    assert_eq!(repository.find(&key).await.unwrap(), None);
}

#[rstest]
#[tokio::test]
async fn test_filtered_pages(#[future] test_context: TestContext) {
    let test_context = test_context.await;
    let ctx = &test_context.context;
    let repository = ctx.repository.clone();

    let mut records: Vec<Record> = (1..=9).map(|seq| event("acme", seq)).collect();
    records.push(event("globex", 1));
    repository.insert_all(&records).await.unwrap();

    let sort = vec!["seq".to_string()];
    let page = repository
        .find_page_where(
            "tenant=acme && (kind=view || seq>=8)",
            1,
            2,
            &sort,
            Direction::Descending,
        )
        .await
        .unwrap();

    // Matching: 9, 8, 7, 5, 3, 1
    assert_eq!(page.total_count, 6);
    assert_eq!(page.total_pages, 3);
    assert_eq!(seqs(&page.items), vec![Value::Long(7), Value::Long(5)]);

    let found = repository
        .find_where(
            "happenedAt>=2024-02-09T00:00:00 || tenant!=acme",
            &[],
            Direction::Ascending,
        )
        .await
        .unwrap();
    assert_eq!(found, vec![records[8].clone(), records[9].clone()]);

    let err = repository
        .find_where("amount~1%", &[], Direction::Ascending)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidFilter(_)));
    assert!(err.is_client_error());
}

#[rstest]
#[tokio::test]
async fn test_batched_writes(#[future] test_context: TestContext) {
    let test_context = test_context.await;
    let ctx = &test_context.context;
    let repository = ctx.repository.clone();

    // More records than fit in one batch
    let records: Vec<Record> = (1..=10).map(|seq| event("acme", seq)).collect();
    assert_eq!(repository.insert_all(&records).await.unwrap(), records);

    let patches: Vec<Record> = (1..=10)
        .map(|seq| {
            if seq % 2 == 0 {
                record(&[
                    ("tenant", Value::from("acme")),
                    ("seq", Value::Long(seq)),
                    ("kind", Value::from("purchase")),
                ])
            } else {
                record(&[
                    ("tenant", Value::from("acme")),
                    ("seq", Value::Long(seq)),
                    ("amount", Value::Decimal(BigDecimal::from(0))),
                ])
            }
        })
        .collect();
    let updated = repository.update_all(&patches).await.unwrap();
    assert_eq!(updated.len(), 10);

    let purchases = repository
        .find_where("kind=purchase", &[], Direction::Ascending)
        .await
        .unwrap();
    assert_eq!(
        seqs(&purchases),
        (1..=5).map(|i| Value::Long(i * 2)).collect::<Vec<_>>()
    );
    let zeroed = repository
        .find_where("amount=0", &[], Direction::Ascending)
        .await
        .unwrap();
    assert_eq!(zeroed.len(), 5);

    let keys: Vec<Record> = (1..=10)
        .map(|seq| ctx.fields.key_of(&event("acme", seq)))
        .collect();
    let deleted = repository.delete_all(&keys).await.unwrap();
    assert_eq_unordered!(deleted, updated);
    assert!(repository
        .find_all(&[], Direction::Ascending)
        .await
        .unwrap()
        .is_empty());
}
