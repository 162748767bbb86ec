use docmap::{
    bson::{doc, oid::ObjectId},
    error::DocMapError,
    memory::{InMemoryStore, IndexRecord},
    prelude::*,
};

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
struct Location {
    #[docmap(indexed)]
    city: String,
    country: String,
}

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
#[docmap(collection = "accounts")]
struct Account {
    #[docmap(id)]
    id: Option<ObjectId>,
    #[docmap(indexed(unique, name = "email_idx"))]
    email: String,
    #[docmap(indexed(desc))]
    created: i64,
    #[docmap(rename = "loc")]
    location: Option<Location>,
}

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
#[docmap(collection = "events", capped(size = 4096, max = 2))]
struct Event {
    #[docmap(id)]
    id: Option<ObjectId>,
    message: String,
}

fn account(email: &str) -> Account {
    Account {
        email: email.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn declared_indexes_are_created() {
    let datastore = Datastore::new(InMemoryStore::new());
    datastore.ensure_indexes::<Account>().await.unwrap();

    let indexes = datastore.backend().indexes("accounts").await;
    assert_eq!(
        indexes,
        vec![
            IndexRecord {
                keys: doc! { "email": 1 },
                options: doc! { "name": "email_idx", "unique": true },
            },
            IndexRecord {
                keys: doc! { "created": -1 },
                options: doc! {},
            },
            IndexRecord {
                keys: doc! { "loc.city": 1 },
                options: doc! {},
            },
        ]
    );
}

#[tokio::test]
async fn ensuring_indexes_twice_changes_nothing() {
    let datastore = Datastore::new(InMemoryStore::new());
    datastore.ensure_indexes::<Account>().await.unwrap();
    datastore.ensure_indexes::<Account>().await.unwrap();

    assert_eq!(datastore.backend().indexes("accounts").await.len(), 3);
}

#[tokio::test]
async fn unique_indexes_reject_duplicate_entities() {
    let datastore = Datastore::new(InMemoryStore::new());
    datastore.ensure_indexes::<Account>().await.unwrap();

    datastore.save(&mut account("ada@example.com")).await.unwrap();
    let mut duplicate = account("ada@example.com");
    let err = datastore.save(&mut duplicate).await.unwrap_err();

    assert!(matches!(err, DocMapError::Backend(_)));
    assert_eq!(duplicate.id, None);
    assert_eq!(datastore.count::<Account>().await.unwrap(), 1);
}

#[tokio::test]
async fn all_mapped_types_get_their_indexes() {
    let datastore = Datastore::new(InMemoryStore::new());
    datastore.map::<Account>().map::<Event>();

    datastore.ensure_all_indexes().await.unwrap();

    assert_eq!(datastore.backend().indexes("accounts").await.len(), 3);
    assert!(datastore.backend().indexes("events").await.is_empty());
}

#[tokio::test]
async fn capped_collections_are_created_with_their_limits() {
    let datastore = Datastore::new(InMemoryStore::new());
    datastore.ensure_caps::<Event>().await.unwrap();
    datastore.ensure_caps::<Account>().await.unwrap();

    assert_eq!(
        datastore.backend().collection_options("events").await,
        Some(doc! { "capped": true, "size": 4096_i64, "max": 2_i64 })
    );
    assert_eq!(datastore.backend().collection_options("accounts").await, None);

    for message in ["one", "two", "three"] {
        datastore
            .save(&mut Event {
                id: None,
                message: message.to_string(),
            })
            .await
            .unwrap();
    }

    let messages = datastore
        .find::<Event>()
        .as_list()
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.message)
        .collect::<Vec<_>>();
    assert_eq!(messages, vec!["two", "three"]);
}

#[tokio::test]
async fn collections_can_be_listed_and_dropped() {
    let datastore = Datastore::new(InMemoryStore::new());
    datastore.save(&mut account("ada@example.com")).await.unwrap();
    datastore
        .save(&mut Event {
            id: None,
            message: "hello".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        datastore.list_collections().await.unwrap(),
        vec!["accounts".to_string(), "events".to_string()]
    );

    datastore.drop_collection::<Event>().await.unwrap();
    assert_eq!(
        datastore.list_collections().await.unwrap(),
        vec!["accounts".to_string()]
    );
    assert_eq!(datastore.count::<Event>().await.unwrap(), 0);
}
