//! Fixtures for tests and the stress tool.

use crate::schema;

/// A student record, with one field of most supported field types.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Student {
    pub name: String,
    pub surname: String,
    pub age: i32,
    pub average_mark: char,
    pub scholarship: bool,
}

impl Student {
    pub fn new(name: &str, age: i32) -> Self {
        Student {
            name: name.into(),
            age,
            ..Default::default()
        }
    }
}

schema!(Student as "serializator.Student" {
    name: String,
    surname: String,
    age: i32,
    average_mark: char,
    scholarship: bool,
});
