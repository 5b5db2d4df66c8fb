//! Property-based tests for query compilation and persistence

mod common;

use proptest::prelude::*;
use regex::Regex;

use common::*;
use runtara_datastore::document::MemoryDocumentClient;
use runtara_datastore::document::query::like_to_regex;
use runtara_datastore::{Query, restrictions};

fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .*+?()\\[\\]{}|^$\\\\]{0,12}").expect("Invalid regex")
}

fn ages_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..100, 1..12)
}

fn emails_strategy() -> impl Strategy<Value = Vec<Option<String>>> {
    prop::collection::vec(prop::option::of("[a-f]{1,3}"), 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_like_without_wildcards_matches_only_itself(text in text_strategy(), other in text_strategy()) {
        let regex = Regex::new(&like_to_regex(&text)).unwrap();
        prop_assert!(regex.is_match(&text));
        prop_assert_eq!(regex.is_match(&other), other == text);
    }

    #[test]
    fn prop_like_contains_matches_any_surrounding(
        prefix in text_strategy(),
        middle in text_strategy(),
        suffix in text_strategy(),
    ) {
        let regex = Regex::new(&like_to_regex(&format!("%{}%", middle))).unwrap();
        let haystack = format!("{}{}{}", prefix, middle, suffix);
        prop_assert!(regex.is_match(&haystack));
    }

    #[test]
    fn prop_like_prefix_is_anchored(prefix in "[a-z]{1,6}", rest in text_strategy()) {
        let regex = Regex::new(&like_to_regex(&format!("{}%", prefix))).unwrap();
        let matching = format!("{}{}", prefix, rest);
        let shifted = format!("#{}", matching);
        prop_assert!(regex.is_match(&matching));
        prop_assert!(!regex.is_match(&shifted));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_restriction_and_negation_partition_records(
        ages in ages_strategy(),
        emails in emails_strategy(),
        threshold in 0i64..100,
        cutoff in "[a-f]{1,2}",
    ) {
        let client = MemoryDocumentClient::new();
        let datastore = document_datastore(&client);
        let mut session = datastore.connect().unwrap();
        for (i, age) in ages.iter().enumerate() {
            let record = person(&format!("p{}", i), *age);
            record.borrow_mut().email = emails.get(i).cloned().flatten();
            session.persist(&record).unwrap();
        }
        session.flush().unwrap();

        let older = Query::new("Person")
            .add(restrictions::gt("age", threshold))
            .count(&mut session)
            .unwrap();
        let rest = Query::new("Person")
            .add(restrictions::not(vec![restrictions::gt("age", threshold)]))
            .count(&mut session)
            .unwrap();

        let expected = ages.iter().filter(|a| **a > threshold).count() as u64;
        prop_assert_eq!(older, expected);
        prop_assert_eq!(older + rest, ages.len() as u64);

        // Records without an email match the negation, never the restriction
        for criterion in [
            restrictions::gt("email", cutoff.as_str()),
            restrictions::le("email", cutoff.as_str()),
            restrictions::between("email", "b", cutoff.as_str()),
        ] {
            let matched = Query::new("Person")
                .add(criterion.clone())
                .count(&mut session)
                .unwrap();
            let negated = Query::new("Person")
                .add(restrictions::not(vec![criterion]))
                .count(&mut session)
                .unwrap();
            prop_assert_eq!(matched + negated, ages.len() as u64);
        }

        let after_cutoff = ages
            .iter()
            .enumerate()
            .filter(|(i, _)| emails.get(*i).cloned().flatten().is_some_and(|e| e > cutoff))
            .count() as u64;
        let matched = Query::new("Person")
            .add(restrictions::gt("email", cutoff.as_str()))
            .count(&mut session)
            .unwrap();
        prop_assert_eq!(matched, after_cutoff);
    }

    #[test]
    fn prop_rlike_any_matches_every_present_value(ages in ages_strategy(), emails in emails_strategy()) {
        let client = MemoryDocumentClient::new();
        let datastore = document_datastore(&client);
        let mut session = datastore.connect().unwrap();
        for (i, age) in ages.iter().enumerate() {
            let record = person(&format!("p{}", i), *age);
            record.borrow_mut().email = emails.get(i).cloned().flatten();
            session.persist(&record).unwrap();
        }
        session.flush().unwrap();

        let everyone = Query::new("Person")
            .add(restrictions::rlike("name", ".*"))
            .count(&mut session)
            .unwrap();
        prop_assert_eq!(everyone, ages.len() as u64);

        // A regex only ever matches a string, so null emails are left out
        let with_email = (0..ages.len())
            .filter(|i| emails.get(*i).cloned().flatten().is_some())
            .count() as u64;
        let matched = Query::new("Person")
            .add(restrictions::rlike("email", ".*"))
            .count(&mut session)
            .unwrap();
        prop_assert_eq!(matched, with_email);
    }

    #[test]
    fn prop_between_matches_host_filter(ages in ages_strategy(), low in 0i64..50, span in 0i64..50) {
        let client = MemoryDocumentClient::new();
        let datastore = document_datastore(&client);
        let mut session = datastore.connect().unwrap();
        for (i, age) in ages.iter().enumerate() {
            session.persist(&person(&format!("p{}", i), *age)).unwrap();
        }

        let high = low + span;
        let found = Query::new("Person")
            .add(restrictions::between("age", low, high))
            .count(&mut session)
            .unwrap();
        let expected = ages.iter().filter(|a| (low..=high).contains(*a)).count() as u64;
        prop_assert_eq!(found, expected);
    }

    #[test]
    fn prop_persisted_scalars_survive_reload(name in "\\PC{1,20}", age in any::<i64>()) {
        let client = MemoryDocumentClient::new();
        let datastore = document_datastore(&client);

        let key = {
            let mut session = datastore.connect().unwrap();
            let key = session.persist(&person(&name, age)).unwrap().unwrap();
            session.flush().unwrap();
            key
        };

        let mut session = datastore.connect().unwrap();
        let loaded = session.retrieve::<Person>(&key).unwrap().unwrap();
        prop_assert_eq!(&loaded.borrow().name, &name);
        prop_assert_eq!(loaded.borrow().age, age);
    }
}
