use docmap::{
    bson::{Bson, doc},
    convert::Storable,
    error::{DocMapError, MappingFailure},
    memory::InMemoryStore,
    metadata::FieldMetadata,
    prelude::*,
};
use futures::TryStreamExt;

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
struct Address {
    city: String,
    #[docmap(rename = "zip")]
    postal_code: String,
}

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
#[docmap(collection = "people")]
struct Person {
    #[docmap(id)]
    id: Option<i64>,
    name: String,
    age: i32,
    tags: Vec<String>,
    address: Option<Address>,
}

fn person(id: i64, name: &str, age: i32, tags: &[&str], city: Option<(&str, &str)>) -> Person {
    Person {
        id: Some(id),
        name: name.to_string(),
        age,
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        address: city.map(|(city, zip)| Address {
            city: city.to_string(),
            postal_code: zip.to_string(),
        }),
    }
}

async fn seeded() -> Datastore<InMemoryStore> {
    let datastore = Datastore::new(InMemoryStore::new());
    let mut people = vec![
        person(1, "Ada", 36, &["math", "engines"], Some(("London", "N1"))),
        person(2, "Bob", 25, &["art"], Some(("Paris", "75001"))),
        person(3, "Cy", 41, &["math"], Some(("London", "SW1"))),
        person(4, "Dee", 19, &[], None),
        person(5, "Eve", 30, &["art", "math"], Some(("Berlin", "10115"))),
    ];
    datastore.save_all(&mut people).await.unwrap();
    datastore
}

fn names(people: &[Person]) -> Vec<&str> {
    people.iter().map(|person| person.name.as_str()).collect()
}

#[tokio::test]
async fn comparison_conditions_and_ordering() {
    let datastore = seeded().await;

    let found = datastore
        .find::<Person>()
        .filter("age >=", 30)
        .unwrap()
        .order_by("age")
        .unwrap()
        .as_list()
        .await
        .unwrap();
    assert_eq!(names(&found), vec!["Eve", "Ada", "Cy"]);

    let found = datastore
        .find::<Person>()
        .filter("age >", 20)
        .unwrap()
        .filter("age <", 40)
        .unwrap()
        .filter("name !=", "Ada")
        .unwrap()
        .order("-age")
        .unwrap()
        .as_list()
        .await
        .unwrap();
    assert_eq!(names(&found), vec!["Eve", "Bob"]);
}

#[tokio::test]
async fn nested_paths_use_stored_names() {
    let datastore = seeded().await;

    let mut query = datastore.find_by::<Person, _>("address.city", "London").unwrap();
    let found = query.order_by_desc("age").unwrap().as_list().await.unwrap();
    assert_eq!(names(&found), vec!["Cy", "Ada"]);

    let mut query = datastore.find::<Person>();
    query.filter("address.postal_code", "75001").unwrap();
    assert_eq!(query.filter_document(), &doc! { "address.zip": "75001" });
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Bob"]);
}

#[tokio::test]
async fn membership_and_shape_criteria() {
    let datastore = seeded().await;

    let mut query = datastore.find::<Person>();
    query.field("tags").has_any_of(vec!["art"]).unwrap();
    query.order("id").unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Bob", "Eve"]);

    let mut query = datastore.find::<Person>();
    query.field("tags").has_all_of(vec!["art", "math"]).unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Eve"]);

    let mut query = datastore.find::<Person>();
    query.field("tags").has_none_of(vec!["math"]).unwrap();
    query.order("id").unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Bob", "Dee"]);

    let mut query = datastore.find::<Person>();
    query.field("tags").has_this_one("engines").unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Ada"]);

    let mut query = datastore.find::<Person>();
    query.field("tags").has_size(0).unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Dee"]);

    let mut query = datastore.find::<Person>();
    query.filter("age in", vec![25, 41]).unwrap();
    query.order("id").unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Bob", "Cy"]);
}

#[tokio::test]
async fn existence_pattern_and_modulo_criteria() {
    let datastore = seeded().await;

    let mut query = datastore.find::<Person>();
    query.field("address").not_exists().unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Dee"]);

    let mut query = datastore.find::<Person>();
    query.field("address").exists().unwrap();
    assert_eq!(query.count_all().await.unwrap(), 4);

    let mut query = datastore.find::<Person>();
    query.field("name").matches_pattern_with("^[a-c]", "i").unwrap();
    query.order("id").unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Ada", "Bob", "Cy"]);

    let mut query = datastore.find::<Person>();
    query.field("age").has_modulo(2, 0).unwrap();
    query.order("id").unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Ada", "Eve"]);
}

#[tokio::test]
async fn disjunctions_combine_branches() {
    let datastore = seeded().await;

    let mut query = datastore.find::<Person>();
    let mut young = query.branch();
    young.filter("age <", 20).unwrap();
    let mut named = query.branch();
    named.field("name").equal("Cy").unwrap();

    query.or([young, named]).order("id").unwrap();
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Cy", "Dee"]);
}

#[tokio::test]
async fn keys_and_single_results() {
    let datastore = seeded().await;

    let keys = datastore
        .find::<Person>()
        .filter("age >", 30)
        .unwrap()
        .order("id")
        .unwrap()
        .as_key_list()
        .await
        .unwrap();
    assert_eq!(keys, vec![Key::new("people", 1_i64), Key::new("people", 3_i64)]);

    let key = datastore
        .find_by::<Person, _>("name", "Eve")
        .unwrap()
        .get_key()
        .await
        .unwrap();
    assert_eq!(key, Some(Key::new("people", 5_i64)));

    let youngest = datastore
        .find::<Person>()
        .order("age")
        .unwrap()
        .get()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(youngest.name, "Dee");

    let nobody = datastore
        .find_by::<Person, _>("age >", 100)
        .unwrap()
        .get()
        .await
        .unwrap();
    assert!(nobody.is_none());
}

#[tokio::test]
async fn pages_windows_and_projections() {
    let datastore = seeded().await;

    let page = datastore
        .find::<Person>()
        .order("id")
        .unwrap()
        .page(&PaginationParams::new(2, 2))
        .await
        .unwrap();
    assert_eq!(names(&page.items), vec!["Cy", "Dee"]);
    assert_eq!(page.count, 5);
    assert_eq!(page.next_page, Some(3));
    assert_eq!(page.previous_page, Some(1));

    let window = datastore
        .find::<Person>()
        .order("-age")
        .unwrap()
        .skip(1)
        .limit(2)
        .as_list()
        .await
        .unwrap();
    assert_eq!(names(&window), vec!["Ada", "Eve"]);

    let slim = datastore
        .find_by::<Person, _>("name", "Ada")
        .unwrap()
        .include("name")
        .unwrap()
        .get()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(slim.id, Some(1));
    assert_eq!(slim.age, 0);
    assert!(slim.tags.is_empty());

    let untagged = datastore
        .find_by::<Person, _>("name", "Ada")
        .unwrap()
        .exclude("tags")
        .unwrap()
        .get()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untagged.age, 36);
    assert!(untagged.tags.is_empty());
}

#[tokio::test]
async fn streams_results_lazily() {
    let datastore = seeded().await;

    let query = datastore.find_by::<Person, _>("tags", "math").unwrap();
    let mut stream = query.fetch();
    let mut count = 0;
    while let Some(person) = stream.try_next().await.unwrap() {
        assert!(person.tags.contains(&"math".to_string()));
        count += 1;
    }
    assert_eq!(count, 3);
}

#[tokio::test]
async fn unknown_paths_fail_unless_validation_is_disabled() {
    let datastore = seeded().await;

    let mut query = datastore.find::<Person>();
    let err = query.filter("nickname", "Ace").unwrap_err();
    assert!(matches!(
        err,
        DocMapError::Mapping(MappingFailure::FieldNotFound { ref segment, .. }) if segment == "nickname"
    ));
    assert!(query.filter_document().is_empty());

    query.disable_validation().filter("nickname", "Ace").unwrap();
    assert_eq!(query.filter_document(), &doc! { "nickname": "Ace" });
    assert!(query.as_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_conditions_are_rejected() {
    let datastore = seeded().await;

    let mut query = datastore.find::<Person>();
    assert!(matches!(
        query.filter("age ~", 3),
        Err(DocMapError::IllegalFilterExpression(_))
    ));
    assert!(matches!(
        query.filter("age > 3", 3),
        Err(DocMapError::IllegalFilterExpression(_))
    ));
}

#[tokio::test]
async fn mismatched_literals_still_build_a_query() {
    let datastore = seeded().await;

    let mut query = datastore.find::<Person>();
    query.filter("age", "thirty").unwrap();
    assert_eq!(query.filter_document(), &doc! { "age": "thirty" });
    assert_eq!(query.count_all().await.unwrap(), 0);
}

#[tokio::test]
async fn deletes_matching_entities() {
    let datastore = seeded().await;

    let query = datastore.find_by::<Person, _>("age <", 26).unwrap();
    assert_eq!(datastore.delete_matching(&query).await.unwrap(), 2);
    assert_eq!(datastore.count::<Person>().await.unwrap(), 3);
}

#[tokio::test]
async fn server_side_expressions_are_left_to_the_backend() {
    let datastore = seeded().await;

    let mut query = datastore.find::<Person>();
    query.where_expression("this.age > 30");
    assert_eq!(query.filter_document(), &doc! { "$where": "this.age > 30" });

    let err = query.as_list().await.unwrap_err();
    assert!(matches!(err, DocMapError::Backend(_)));
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Money {
    cents: i64,
}

struct Cents;

impl TypeConverter<Money> for Cents {
    fn encode(&self, value: &Money, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Int64(value.cents))
    }

    fn decode(&self, value: Bson, field: &FieldMetadata) -> MappingResult<Money> {
        Ok(Money {
            cents: i64::from_bson(value, field)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Mapped)]
#[docmap(collection = "listings")]
struct Listing {
    #[docmap(id)]
    id: Option<i64>,
    title: String,
    #[docmap(convert)]
    price: Money,
}

#[tokio::test]
async fn converted_fields_take_converted_operands() {
    let mapper = Mapper::builder().converter::<Money, _>(Cents).build();
    let datastore = Datastore::with_mapper(InMemoryStore::new(), mapper);
    let mut listings = vec![
        Listing { id: Some(1), title: "lamp".into(), price: Money { cents: 1500 } },
        Listing { id: Some(2), title: "desk".into(), price: Money { cents: 12000 } },
        Listing { id: Some(3), title: "pen".into(), price: Money { cents: 300 } },
    ];
    datastore.save_all(&mut listings).await.unwrap();

    let mut query = datastore.find::<Listing>();
    query
        .filter("price >=", Converted(Money { cents: 1000 }))
        .unwrap()
        .order_by("price")
        .unwrap();
    assert_eq!(query.filter_document(), &doc! { "price": { "$gte": 1000_i64 } });
    let titles = query
        .as_list()
        .await
        .unwrap()
        .into_iter()
        .map(|listing| listing.title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["lamp", "desk"]);

    let cheap = datastore
        .find::<Listing>()
        .field("price")
        .has_any_of(vec![Converted(Money { cents: 300 }), Converted(Money { cents: 1 })])
        .unwrap()
        .get()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cheap.price, Money { cents: 300 });

    let unregistered = Datastore::new(InMemoryStore::new());
    let err = unregistered
        .find::<Listing>()
        .filter("price", Converted(Money { cents: 300 }))
        .unwrap_err();
    assert!(matches!(err, DocMapError::Mapping(MappingFailure::NoConverter(_))));
}

#[tokio::test]
async fn entities_can_live_in_explicit_collections() {
    let datastore = seeded().await;
    let mut archived = person(9, "Zed", 50, &["history"], None);

    let key = datastore.save_in("archive", &mut archived).await.unwrap();
    assert_eq!(key, Key::new("archive", 9_i64));
    assert_eq!(datastore.count_in("archive").await.unwrap(), 1);
    assert_eq!(datastore.count_in("people").await.unwrap(), 5);
    assert!(datastore.get::<Person, _>(9_i64).await.unwrap().is_none());

    let loaded = datastore
        .get_in::<Person, _>("archive", 9_i64)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, archived);

    let mut query = datastore.find_in::<Person>("archive");
    query.filter("age >", 40).unwrap();
    assert_eq!(query.collection(), "archive");
    assert_eq!(query.as_key_list().await.unwrap(), vec![Key::new("archive", 9_i64)]);
    assert_eq!(names(&query.as_list().await.unwrap()), vec!["Zed"]);

    assert_eq!(datastore.delete_in::<Person, _>("archive", 9_i64).await.unwrap(), 1);
    assert_eq!(datastore.count_in("archive").await.unwrap(), 0);
    assert_eq!(datastore.count::<Person>().await.unwrap(), 5);
}
