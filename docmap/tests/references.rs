use docmap::{
    backend::{FindRequest, StoreBackend},
    bson::{Bson, doc, oid::ObjectId},
    error::{DocMapError, MappingFailure},
    memory::InMemoryStore,
    prelude::*,
};
use futures::TryStreamExt;

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
#[docmap(collection = "authors")]
struct Author {
    #[docmap(id)]
    id: Option<ObjectId>,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
struct Shelf {
    label: String,
    #[docmap(lazy)]
    curator: Option<Reference<Author>>,
}

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
#[docmap(collection = "books")]
struct Book {
    #[docmap(id)]
    id: Option<String>,
    title: String,
    author: Option<Reference<Author>>,
    #[docmap(reference(lazy))]
    editor: Option<Reference<Author>>,
    reviewers: Vec<Reference<Author>>,
    shelf: Option<Shelf>,
}

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
#[docmap(collection = "nodes")]
struct Node {
    #[docmap(id)]
    id: Option<i64>,
    name: String,
    partner: Option<Reference<Node>>,
}

async fn author(datastore: &Datastore<InMemoryStore>, name: &str) -> Author {
    let mut author = Author {
        id: None,
        name: name.to_string(),
    };
    datastore.save(&mut author).await.unwrap();
    author
}

fn book(title: &str) -> Book {
    Book {
        title: title.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn eager_references_load_with_the_entity() {
    let datastore = Datastore::new(InMemoryStore::new());
    let ada = author(&datastore, "Ada").await;

    let mut notes = book("Notes");
    notes.author = Some(Reference::new(ada.clone()));
    datastore.save(&mut notes).await.unwrap();

    let stored: Vec<_> = datastore
        .backend()
        .find("books", FindRequest::new(doc! {}))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        stored[0].get_document("author").unwrap(),
        &doc! { "$ref": "authors", "$id": ada.id.unwrap() }
    );

    let loaded = datastore
        .get::<Book, _>(notes.id.clone().unwrap())
        .await
        .unwrap()
        .unwrap();
    let reference = loaded.author.as_ref().unwrap();
    assert!(reference.is_resolved());
    assert_eq!(reference.get().unwrap().as_ref(), &ada);
}

#[tokio::test]
async fn missing_eager_targets_fail_the_load() {
    let datastore = Datastore::new(InMemoryStore::new());
    let ada = author(&datastore, "Ada").await;

    let mut notes = book("Notes");
    notes.author = Some(Reference::new(ada.clone()));
    datastore.save(&mut notes).await.unwrap();
    datastore.delete(&ada).await.unwrap();

    let err = datastore
        .get::<Book, _>(notes.id.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DocMapError::Mapping(MappingFailure::ReferenceNotFound(_))
    ));
}

#[tokio::test]
async fn lazy_references_resolve_through_the_datastore() {
    let datastore = Datastore::new(InMemoryStore::new());
    let bob = author(&datastore, "Bob").await;

    let mut notes = book("Notes");
    notes.editor = Some(Reference::new(bob.clone()));
    datastore.save(&mut notes).await.unwrap();

    let loaded = datastore
        .get::<Book, _>(notes.id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let editor = loaded.editor.as_ref().unwrap();
    assert!(!editor.is_resolved());
    assert!(editor.get().is_none());
    assert_eq!(
        editor.key(datastore.mapper()).unwrap(),
        Key::new("authors", bob.id.unwrap())
    );

    let resolved = editor.resolve(&datastore).await.unwrap().unwrap();
    assert_eq!(resolved.name, "Bob");
    assert!(editor.is_resolved());
}

#[tokio::test]
async fn lazy_references_to_missing_targets_resolve_to_nothing() {
    let datastore = Datastore::new(InMemoryStore::new());
    let bob = author(&datastore, "Bob").await;

    let mut notes = book("Notes");
    notes.editor = Some(Reference::new(bob.clone()));
    datastore.save(&mut notes).await.unwrap();
    datastore.delete(&bob).await.unwrap();

    let loaded = datastore
        .get::<Book, _>(notes.id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let editor = loaded.editor.unwrap();
    assert!(editor.resolve(&datastore).await.unwrap().is_none());
    assert!(editor.is_resolved());
}

#[tokio::test]
async fn embedded_values_carry_references() {
    let datastore = Datastore::new(InMemoryStore::new());
    let cy = author(&datastore, "Cy").await;

    let mut notes = book("Notes");
    notes.shelf = Some(Shelf {
        label: "A3".to_string(),
        curator: Some(Reference::lazy(Key::new("authors", cy.id.unwrap()))),
    });
    datastore.save(&mut notes).await.unwrap();

    let loaded = datastore
        .get::<Book, _>(notes.id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let shelf = loaded.shelf.unwrap();
    assert_eq!(shelf.label, "A3");

    let curator = shelf.curator.unwrap();
    assert!(!curator.is_resolved());
    assert_eq!(curator.resolve(&datastore).await.unwrap().unwrap().name, "Cy");
}

#[tokio::test]
async fn lists_of_references_keep_their_order() {
    let datastore = Datastore::new(InMemoryStore::new());
    let ada = author(&datastore, "Ada").await;
    let bob = author(&datastore, "Bob").await;

    let mut notes = book("Notes");
    notes.reviewers = vec![Reference::new(bob.clone()), Reference::new(ada.clone())];
    datastore.save(&mut notes).await.unwrap();

    let loaded = datastore
        .get::<Book, _>(notes.id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let reviewers = loaded
        .reviewers
        .iter()
        .map(|reviewer| reviewer.get().unwrap().name.clone())
        .collect::<Vec<_>>();
    assert_eq!(reviewers, vec!["Bob", "Ada"]);
}

#[tokio::test]
async fn reference_cycles_load_as_placeholders() {
    let datastore = Datastore::new(InMemoryStore::new());
    let mut first = Node {
        id: Some(1),
        name: "first".to_string(),
        partner: Some(Reference::lazy(Key::new("nodes", 2_i64))),
    };
    let mut second = Node {
        id: Some(2),
        name: "second".to_string(),
        partner: Some(Reference::lazy(Key::new("nodes", 1_i64))),
    };
    datastore.save(&mut first).await.unwrap();
    datastore.save(&mut second).await.unwrap();

    let loaded = datastore.get::<Node, _>(1_i64).await.unwrap().unwrap();
    let partner = loaded.partner.as_ref().unwrap().get().unwrap();
    assert_eq!(partner.name, "second");

    let back = partner.partner.as_ref().unwrap();
    assert!(!back.is_resolved());
    assert_eq!(back.key(datastore.mapper()).unwrap(), Key::new("nodes", 1_i64));
    assert_eq!(back.resolve(&datastore).await.unwrap().unwrap().name, "first");
}

#[tokio::test]
async fn self_references_do_not_recurse() {
    let datastore = Datastore::new(InMemoryStore::new());
    let mut lonely = Node {
        id: Some(7),
        name: "lonely".to_string(),
        partner: Some(Reference::lazy(Key::new("nodes", 7_i64))),
    };
    datastore.save(&mut lonely).await.unwrap();

    let loaded = datastore.get::<Node, _>(7_i64).await.unwrap().unwrap();
    let partner = loaded.partner.unwrap();
    assert!(!partner.is_resolved());
    assert_eq!(partner.key(datastore.mapper()).unwrap().id(), &Bson::Int64(7));
}

#[tokio::test]
async fn unsaved_targets_cannot_be_referenced() {
    let datastore = Datastore::new(InMemoryStore::new());

    let mut notes = book("Notes");
    notes.author = Some(Reference::new(Author {
        id: None,
        name: "Nobody".to_string(),
    }));

    let err = datastore.save(&mut notes).await.unwrap_err();
    assert!(matches!(
        err,
        DocMapError::Mapping(MappingFailure::UnsavedReference { ref field, .. }) if field == "author"
    ));
    assert_eq!(datastore.count::<Book>().await.unwrap(), 0);
}

#[tokio::test]
async fn entities_match_reference_fields_by_key() {
    let datastore = Datastore::new(InMemoryStore::new());
    let ada = author(&datastore, "Ada").await;
    let bob = author(&datastore, "Bob").await;

    let mut notes = book("Notes");
    notes.author = Some(Reference::new(ada.clone()));
    datastore.save(&mut notes).await.unwrap();
    let mut sketch = book("Sketch");
    sketch.author = Some(Reference::new(bob.clone()));
    sketch.reviewers = vec![Reference::new(ada.clone())];
    datastore.save(&mut sketch).await.unwrap();

    let mut by_author = datastore.find::<Book>();
    by_author.filter("author", ada.clone()).unwrap();
    assert_eq!(
        by_author.filter_document(),
        &doc! { "author": { "$ref": "authors", "$id": ada.id.unwrap() } }
    );
    let titles = by_author
        .as_list()
        .await
        .unwrap()
        .into_iter()
        .map(|book| book.title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["Notes"]);

    let reviewed = datastore
        .find::<Book>()
        .field("reviewers")
        .has_this_one(ada.clone())
        .unwrap()
        .get()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reviewed.title, "Sketch");

    let either = datastore
        .find::<Book>()
        .field("author")
        .has_any_of(vec![ada.clone(), bob.clone()])
        .unwrap()
        .count_all()
        .await
        .unwrap();
    assert_eq!(either, 2);

    let err = datastore
        .find::<Book>()
        .filter("author", Author::default())
        .unwrap_err();
    assert!(matches!(
        err,
        DocMapError::Mapping(MappingFailure::UnsavedReference { ref field, .. }) if field == "author"
    ));
}
