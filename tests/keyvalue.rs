//! End-to-end tests against the in-memory key-value store

mod common;

use std::rc::Rc;

use common::*;
use runtara_datastore::keyvalue::{KeyValueBackend, MemoryKeyValueClient, MemoryKeyValueConnection};
use runtara_datastore::model::builder::downcast;
use runtara_datastore::{DatastoreError, Order, Query, Session, object, restrictions};

type KeyValueSession = Session<KeyValueBackend<MemoryKeyValueConnection>>;

fn seed(session: &mut KeyValueSession) {
    for (name, country, population) in [
        ("Lyon", "France", 500),
        ("Nice", "France", 340),
        ("Porto", "Portugal", 230),
        ("Braga", "Portugal", 190),
    ] {
        session.persist(&city(name, country, population)).unwrap();
    }
    session
        .persist(&object(Capital {
            city: City {
                name: "Paris".to_string(),
                country: "France".to_string(),
                population: 2100,
                ..Default::default()
            },
            since: 508,
        }))
        .unwrap();
    session.flush().unwrap();
}

fn names(cities: &[Rc<std::cell::RefCell<City>>]) -> Vec<String> {
    cities.iter().map(|c| c.borrow().name.clone()).collect()
}

// ==================== Storage Layout ====================

#[test]
fn test_entries_are_hashes_with_id_set() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    let mut session = datastore.connect().unwrap();
    seed(&mut session);

    let lyon = client.hash("test", "City:1").unwrap();
    assert_eq!(lyon.get("name"), Some(&serde_json::json!("Lyon")));
    assert!(!lyon.contains_key("_class"));

    let paris = client.hash("test", "City:5").unwrap();
    assert_eq!(paris.get("_class"), Some(&serde_json::json!("Capital")));

    assert_eq!(client.members("test", "City.all"), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(client.members("test", "City:country:France"), vec!["1", "2", "5"]);
}

#[test]
fn test_round_trip_and_polymorphic_retrieve() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    {
        let mut session = datastore.connect().unwrap();
        seed(&mut session);
    }

    let mut session = datastore.connect().unwrap();
    let porto = session.retrieve::<City>(&3).unwrap().unwrap();
    assert_eq!(porto.borrow().name, "Porto");
    assert_eq!(porto.borrow().population, 230);
    assert_eq!(porto.borrow().version, Some(0));

    let paris = session.retrieve_object("City", &5).unwrap().unwrap();
    let paris = downcast::<Capital>(paris).unwrap();
    assert_eq!(paris.borrow().since, 508);
    assert!(session.retrieve::<City>(&42).unwrap().is_none());
}

// ==================== Queries ====================

#[test]
fn test_indexed_equality_queries() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    let mut session = datastore.connect().unwrap();
    seed(&mut session);

    let french = Query::new("City")
        .add(restrictions::eq("country", "France"))
        .order(Order::desc("population"))
        .list(&mut session)
        .unwrap()
        .into_objects()
        .unwrap();
    assert_eq!(french.len(), 3);
    assert!(downcast::<Capital>(french[0].clone()).is_ok());
    assert_eq!(downcast::<City>(french[1].clone()).unwrap().borrow().name, "Lyon");

    let capitals = Query::new("Capital")
        .add(restrictions::eq("country", "France"))
        .list_of::<Capital, _>(&mut session)
        .unwrap();
    assert_eq!(capitals.len(), 1);
    assert_eq!(capitals[0].borrow().city.name, "Paris");

    let portuguese = Query::new("City")
        .add(restrictions::in_list("country", ["Portugal"]))
        .order(Order::asc("name"))
        .list_of::<City, _>(&mut session)
        .unwrap();
    assert_eq!(names(&portuguese), vec!["Braga", "Porto"]);

    let by_id = Query::new("City")
        .add(restrictions::id_eq(2))
        .add(restrictions::eq("country", "France"))
        .list_of::<City, _>(&mut session)
        .unwrap();
    assert_eq!(names(&by_id), vec!["Nice"]);

    let paged = Query::new("City")
        .add(restrictions::eq("country", "Portugal"))
        .order(Order::desc("population"))
        .paginate(1, 5)
        .list_of::<City, _>(&mut session)
        .unwrap();
    assert_eq!(names(&paged), vec!["Braga"]);
}

#[test]
fn test_unindexed_and_range_queries_are_rejected() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    let mut session = datastore.connect().unwrap();
    seed(&mut session);

    let unindexed = Query::new("City")
        .add(restrictions::eq("name", "Lyon"))
        .list(&mut session)
        .unwrap_err();
    assert!(matches!(unindexed, DatastoreError::UnsupportedQuery(_)));

    let range = Query::new("City")
        .add(restrictions::gt("population", 300))
        .count(&mut session)
        .unwrap_err();
    assert!(matches!(range, DatastoreError::UnsupportedQuery(_)));

    let disjunction = Query::new("City")
        .add(restrictions::or(vec![
            restrictions::eq("country", "France"),
            restrictions::eq("country", "Portugal"),
        ]))
        .count(&mut session)
        .unwrap_err();
    assert!(matches!(disjunction, DatastoreError::UnsupportedQuery(_)));
}

// ==================== Updates and Deletes ====================

#[test]
fn test_update_moves_index_membership() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    let mut session = datastore.connect().unwrap();
    seed(&mut session);

    let nice = session.retrieve::<City>(&2).unwrap().unwrap();
    nice.borrow_mut().country = "Monaco".to_string();
    session.persist(&nice).unwrap();
    session.flush().unwrap();

    assert_eq!(nice.borrow().version, Some(1));
    assert_eq!(client.members("test", "City:country:France"), vec!["1", "5"]);
    assert_eq!(client.members("test", "City:country:Monaco"), vec!["2"]);
}

#[test]
fn test_stale_update_is_rejected() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    {
        let mut session = datastore.connect().unwrap();
        seed(&mut session);
    }

    let mut first = datastore.connect().unwrap();
    let mut second = datastore.connect().unwrap();
    let mine = first.retrieve::<City>(&1).unwrap().unwrap();
    let theirs = second.retrieve::<City>(&1).unwrap().unwrap();

    mine.borrow_mut().population = 510;
    first.persist(&mine).unwrap();
    first.flush().unwrap();

    theirs.borrow_mut().population = 1;
    second.persist(&theirs).unwrap();
    assert!(matches!(
        second.flush(),
        Err(DatastoreError::OptimisticLocking { .. })
    ));
    let stored = client.hash("test", "City:1").unwrap();
    assert_eq!(stored.get("population"), Some(&serde_json::json!(510)));
}

#[test]
fn test_delete_removes_hash_and_memberships() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    let mut session = datastore.connect().unwrap();
    seed(&mut session);

    let lyon = session.retrieve::<City>(&1).unwrap().unwrap();
    session.delete(&lyon).unwrap();
    session.flush().unwrap();

    assert!(client.hash("test", "City:1").is_none());
    assert!(!client.members("test", "City.all").contains(&"1".to_string()));
    assert_eq!(
        Query::new("City")
            .add(restrictions::eq("country", "France"))
            .count(&mut session)
            .unwrap(),
        2
    );
}

// ==================== Associations ====================

#[test]
fn test_one_to_many_side_list() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);

    let author_key = {
        let mut session = datastore.connect().unwrap();
        let author = object(Author {
            name: "Pratchett".to_string(),
            books: vec![book("Mort", 243), book("Sourcery", 256)],
            ..Default::default()
        });
        let key = session.persist(&author).unwrap().unwrap();
        session.flush().unwrap();
        key
    };

    assert_eq!(client.members("test", "Author:1:books"), vec!["1", "2"]);
    assert_eq!(client.members("test", "Book:author:1"), vec!["1", "2"]);

    let mut session = datastore.connect().unwrap();
    let author = session.retrieve::<Author>(&author_key).unwrap().unwrap();
    let titles: Vec<String> = author.borrow().books.iter().map(|b| b.borrow().title.clone()).collect();
    assert_eq!(titles, vec!["Mort", "Sourcery"]);

    let book = session.retrieve::<Book>(&2).unwrap().unwrap();
    let owner = book.borrow().author.clone().unwrap();
    assert!(Rc::ptr_eq(&owner, &author));
}

// ==================== Capabilities ====================

#[test]
fn test_transactions_are_unsupported() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    let mut session = datastore.connect().unwrap();

    let err = session.begin_transaction().unwrap_err();
    assert!(matches!(err, DatastoreError::TransactionUnsupported(_)));
    assert!(session.transaction().is_none());
}

#[test]
fn test_identifiers_come_from_counter() {
    let client = MemoryKeyValueClient::new();
    let datastore = keyvalue_datastore(&client);
    let mut session = datastore.connect().unwrap();

    let first = city("A", "X", 1);
    let second = city("B", "X", 1);
    session.persist(&first).unwrap();
    session.persist(&second).unwrap();
    assert_eq!(first.borrow().id, Some(1));
    assert_eq!(second.borrow().id, Some(2));
    assert!(client.keys("test").contains(&"City.next_id".to_string()));

    session.disconnect().unwrap();
    assert_eq!(client.open_connections(), 0);
}
