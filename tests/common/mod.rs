//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use runtara_datastore::document::MemoryDocumentClient;
use runtara_datastore::keyvalue::MemoryKeyValueClient;
use runtara_datastore::{Datastore, DatastoreConfig, EntityBuilder, MappingContext, PropertyType, object};

#[derive(Debug, Default)]
pub struct Address {
    pub street: String,
    pub city: String,
}

#[derive(Debug, Default)]
pub struct Person {
    pub id: Option<i64>,
    pub version: Option<i64>,
    pub name: String,
    pub age: i64,
    pub email: Option<String>,
    pub home: Option<Rc<RefCell<Address>>>,
    pub date_created: Option<String>,
}

#[derive(Debug, Default)]
pub struct Author {
    pub id: Option<i64>,
    pub name: String,
    pub books: Vec<Rc<RefCell<Book>>>,
}

#[derive(Debug, Default)]
pub struct Book {
    pub id: Option<i64>,
    pub version: Option<i64>,
    pub title: String,
    pub pages: i64,
    pub author: Option<Rc<RefCell<Author>>>,
}

#[derive(Debug, Default)]
pub struct Animal {
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct Dog {
    pub animal: Animal,
    pub breed: String,
}

#[derive(Debug, Default)]
pub struct Tag {
    pub id: Option<i64>,
    pub label: String,
}

#[derive(Debug, Default)]
pub struct Post {
    pub id: Option<i64>,
    pub title: String,
    pub tags: Vec<Rc<RefCell<Tag>>>,
}

pub fn animal_mapping() -> EntityBuilder<Animal> {
    EntityBuilder::<Animal>::new()
        .identity("id", PropertyType::Integer, |a| a.id, |a, v| a.id = v)
        .property("name", PropertyType::String, |a| a.name.clone(), |a, v| a.name = v)
}

/// Mapping context holding every fixture entity
pub fn mapping_context() -> MappingContext {
    let context = MappingContext::new();
    context
        .add(
            EntityBuilder::<Address>::new()
                .embeddable()
                .property("street", PropertyType::String, |a| a.street.clone(), |a, v| a.street = v)
                .property("city", PropertyType::String, |a| a.city.clone(), |a, v| a.city = v),
        )
        .unwrap();
    context
        .add(
            EntityBuilder::<Person>::new()
                .identity("id", PropertyType::Integer, |p| p.id, |p, v| p.id = v)
                .version("version", |p| p.version, |p, v| p.version = v)
                .property("name", PropertyType::String, |p| p.name.clone(), |p, v| p.name = v)
                .not_null()
                .property("age", PropertyType::Integer, |p| p.age, |p, v| p.age = v)
                .property("email", PropertyType::String, |p| p.email.clone(), |p, v| p.email = v)
                .embedded::<Address, _, _>("home", |p| p.home.clone(), |p, v| p.home = v)
                .property(
                    "dateCreated",
                    PropertyType::Timestamp,
                    |p| p.date_created.clone(),
                    |p, v| p.date_created = v,
                ),
        )
        .unwrap();
    context
        .add(
            EntityBuilder::<Author>::new()
                .identity("id", PropertyType::Integer, |a| a.id, |a, v| a.id = v)
                .property("name", PropertyType::String, |a| a.name.clone(), |a, v| a.name = v)
                .one_to_many::<Book, _, _>("books", |a| a.books.clone(), |a, v| a.books = v)
                .mapped_by("author"),
        )
        .unwrap();
    context
        .add(
            EntityBuilder::<Book>::new()
                .identity("id", PropertyType::Integer, |b| b.id, |b, v| b.id = v)
                .version("version", |b| b.version, |b, v| b.version = v)
                .property("title", PropertyType::String, |b| b.title.clone(), |b, v| b.title = v)
                .property("pages", PropertyType::Integer, |b| b.pages, |b, v| b.pages = v)
                .many_to_one::<Author, _, _>("author", |b| b.author.clone(), |b, v| b.author = v)
                .inverse_of("books"),
        )
        .unwrap();
    context.add(animal_mapping()).unwrap();
    context
        .add(
            EntityBuilder::<Dog>::new()
                .extends(animal_mapping(), |d| &d.animal, |d| &mut d.animal)
                .property("breed", PropertyType::String, |d| d.breed.clone(), |d, v| d.breed = v),
        )
        .unwrap();
    context
        .add(
            EntityBuilder::<Tag>::new()
                .identity("id", PropertyType::Integer, |t| t.id, |t, v| t.id = v)
                .property("label", PropertyType::String, |t| t.label.clone(), |t, v| t.label = v),
        )
        .unwrap();
    context
        .add(
            EntityBuilder::<Post>::new()
                .identity("id", PropertyType::Integer, |p| p.id, |p, v| p.id = v)
                .property("title", PropertyType::String, |p| p.title.clone(), |p, v| p.title = v)
                .many_to_many::<Tag, _, _>("tags", |p| p.tags.clone(), |p, v| p.tags = v),
        )
        .unwrap();
    context
}

pub fn config() -> DatastoreConfig {
    DatastoreConfig::builder("memory://local").build()
}

pub fn document_datastore(client: &MemoryDocumentClient) -> Datastore<MemoryDocumentClient> {
    Datastore::new(client.clone(), Arc::new(mapping_context()), config()).unwrap()
}

pub fn person(name: &str, age: i64) -> Rc<RefCell<Person>> {
    object(Person {
        name: name.to_string(),
        age,
        ..Default::default()
    })
}

pub fn book(title: &str, pages: i64) -> Rc<RefCell<Book>> {
    object(Book {
        title: title.to_string(),
        pages,
        ..Default::default()
    })
}

/// Key-value mapping: flat entities with indexed lookups
#[derive(Debug, Default)]
pub struct City {
    pub id: Option<i64>,
    pub version: Option<i64>,
    pub name: String,
    pub country: String,
    pub population: i64,
}

#[derive(Debug, Default)]
pub struct Capital {
    pub city: City,
    pub since: i64,
}

pub fn city_mapping() -> EntityBuilder<City> {
    EntityBuilder::<City>::new()
        .identity("id", PropertyType::Integer, |c| c.id, |c, v| c.id = v)
        .version("version", |c| c.version, |c, v| c.version = v)
        .property("name", PropertyType::String, |c| c.name.clone(), |c, v| c.name = v)
        .property("country", PropertyType::String, |c| c.country.clone(), |c, v| c.country = v)
        .index()
        .property("population", PropertyType::Integer, |c| c.population, |c, v| c.population = v)
}

pub fn keyvalue_datastore(client: &MemoryKeyValueClient) -> Datastore<MemoryKeyValueClient> {
    let context = MappingContext::new();
    context.add(city_mapping()).unwrap();
    context
        .add(
            EntityBuilder::<Capital>::new()
                .extends(city_mapping(), |c| &c.city, |c| &mut c.city)
                .property("since", PropertyType::Integer, |c| c.since, |c, v| c.since = v),
        )
        .unwrap();
    context
        .add(
            EntityBuilder::<Author>::new()
                .identity("id", PropertyType::Integer, |a| a.id, |a, v| a.id = v)
                .property("name", PropertyType::String, |a| a.name.clone(), |a, v| a.name = v)
                .one_to_many::<Book, _, _>("books", |a| a.books.clone(), |a, v| a.books = v)
                .mapped_by("author"),
        )
        .unwrap();
    context
        .add(
            EntityBuilder::<Book>::new()
                .identity("id", PropertyType::Integer, |b| b.id, |b, v| b.id = v)
                .version("version", |b| b.version, |b, v| b.version = v)
                .property("title", PropertyType::String, |b| b.title.clone(), |b, v| b.title = v)
                .property("pages", PropertyType::Integer, |b| b.pages, |b, v| b.pages = v)
                .many_to_one::<Author, _, _>("author", |b| b.author.clone(), |b, v| b.author = v)
                .inverse_of("books")
                .index(),
        )
        .unwrap();
    Datastore::new(client.clone(), Arc::new(context), config()).unwrap()
}

pub fn city(name: &str, country: &str, population: i64) -> Rc<RefCell<City>> {
    object(City {
        name: name.to_string(),
        country: country.to_string(),
        population,
        ..Default::default()
    })
}
