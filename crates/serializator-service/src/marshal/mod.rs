//! Conversion between objects and flat, string-keyed property mappings.
//!
//! Every type that can be stored in a [`Serializator`](crate::caching::Serializator) declares
//! its fields up front via the [`Schema`] trait. Each [`Field`] knows its name, how to read the
//! value out of an object and how to write it back, and converts the value to and from a string
//! with a [`FieldCodec`]. Only a fixed set of primitive types and [`String`] implement
//! [`FieldCodec`].
//!
//! The [`PropertiesMarshaller`] turns an object into a [`Properties`] mapping, adding the
//! reserved [`CANONICAL_NAME_KEY`] entry which carries the [`Schema::TYPE_NAME`]. Decoding
//! requires that entry to be present and to match the requested type.
//!
//! The [`schema!`](crate::schema) macro implements [`Schema`] for plain structs:
//!
//! ```
//! use serializator_service::schema;
//!
//! #[derive(Clone, Debug, Default, PartialEq)]
//! struct Point {
//!     x: i32,
//!     y: i32,
//!     label: String,
//! }
//!
//! schema!(Point as "geometry.Point" {
//!     x: i32,
//!     y: i32,
//!     label: String,
//! });
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use crate::caching::{CacheEntry, CacheError};

pub mod properties;

/// The reserved entry holding the type identity of a persisted object.
pub const CANONICAL_NAME_KEY: &str = "canonicalName";

/// A flat, ordered mapping of property names to their string values.
pub type Properties = BTreeMap<String, String>;

/// Converts a single field value to and from its string representation.
pub trait FieldCodec: Sized {
    /// Renders the value as a property string.
    fn to_property(&self) -> String;

    /// Parses the value from a property string.
    ///
    /// The error describes why the string could not be converted.
    fn from_property(value: &str) -> Result<Self, String>;
}

impl FieldCodec for String {
    fn to_property(&self) -> String {
        self.clone()
    }

    fn from_property(value: &str) -> Result<Self, String> {
        Ok(value.to_owned())
    }
}

impl FieldCodec for bool {
    fn to_property(&self) -> String {
        self.to_string()
    }

    fn from_property(value: &str) -> Result<Self, String> {
        if value.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if value.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(format!("`{value}` is not a boolean"))
        }
    }
}

impl FieldCodec for char {
    fn to_property(&self) -> String {
        self.to_string()
    }

    fn from_property(value: &str) -> Result<Self, String> {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(format!("`{value}` is not a single character")),
        }
    }
}

macro_rules! impl_parsed_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FieldCodec for $ty {
                fn to_property(&self) -> String {
                    self.to_string()
                }

                fn from_property(value: &str) -> Result<Self, String> {
                    value.parse::<$ty>().map_err(|e| format!("`{value}`: {e}"))
                }
            }
        )*
    };
}

impl_parsed_codec!(i8, i16, i32, i64, f32, f64);

type Getter<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, &str) -> Result<(), String> + Send + Sync>;

/// A statically declared field of a [`Schema`] type.
pub struct Field<T> {
    name: &'static str,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> Field<T> {
    /// Declares a field with its accessors.
    ///
    /// The value type `V` determines the [`FieldCodec`] used for the field.
    pub fn new<V, G, S>(name: &'static str, get: G, set: S) -> Self
    where
        V: FieldCodec,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        Field {
            name,
            get: Box::new(move |object| get(object).to_property()),
            set: Box::new(move |object, value| {
                set(object, V::from_property(value)?);
                Ok(())
            }),
        }
    }

    /// The property name of this field.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reads the field out of `object` as a property string.
    pub fn get(&self, object: &T) -> String {
        (self.get)(object)
    }

    /// Parses `value` and writes it into `object`.
    pub fn set(&self, object: &mut T, value: &str) -> CacheEntry {
        (self.set)(object, value).map_err(|details| CacheError::UnsupportedFieldType {
            field: self.name.to_owned(),
            details,
        })
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("name", &self.name).finish()
    }
}

/// A type with a statically declared set of persisted fields.
///
/// Decoding starts from [`Default::default`] and applies every field present in the mapping.
pub trait Schema: Default + Send + Sync + 'static {
    /// The canonical type identity written to the [`CANONICAL_NAME_KEY`] entry.
    const TYPE_NAME: &'static str;

    /// All fields that are persisted for this type.
    fn fields() -> Vec<Field<Self>>;
}

/// Implements [`Schema`](crate::marshal::Schema) for a struct with public or crate-visible fields.
///
/// Every listed field is cloned on encode and assigned on decode.
#[macro_export]
macro_rules! schema {
    ($ty:ty as $name:literal { $($field:ident : $fty:ty),* $(,)? }) => {
        impl $crate::marshal::Schema for $ty {
            const TYPE_NAME: &'static str = $name;

            fn fields() -> ::std::vec::Vec<$crate::marshal::Field<Self>> {
                ::std::vec![
                    $(
                        $crate::marshal::Field::new(
                            stringify!($field),
                            |object: &$ty| -> $fty { ::std::clone::Clone::clone(&object.$field) },
                            |object: &mut $ty, value: $fty| object.$field = value,
                        ),
                    )*
                ]
            }
        }
    };
}

/// Converts objects of type `T` to and from a [`Properties`] mapping.
pub trait ObjectMarshaller<T>: Send + Sync + 'static {
    /// The canonical type identity of `T`.
    fn type_name(&self) -> &str;

    /// Encodes `object`, including the reserved type identity entry.
    fn encode(&self, object: &T) -> Properties;

    /// Reconstructs an object from `properties`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::MissingTypeIdentity`] if the reserved entry is absent.
    /// - [`CacheError::TypeMismatch`] if the mapping was written for another type.
    /// - [`CacheError::UnsupportedFieldType`] if a field value cannot be parsed.
    fn decode(&self, properties: &Properties) -> CacheEntry<T>;
}

/// The default [`ObjectMarshaller`], driven by the [`Schema`] of `T`.
pub struct PropertiesMarshaller<T> {
    fields: Vec<Field<T>>,
    _ty: PhantomData<fn() -> T>,
}

impl<T: Schema> PropertiesMarshaller<T> {
    pub fn new() -> Self {
        PropertiesMarshaller {
            fields: T::fields(),
            _ty: PhantomData,
        }
    }
}

impl<T: Schema> Default for PropertiesMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PropertiesMarshaller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertiesMarshaller")
            .field("fields", &self.fields)
            .finish()
    }
}

impl<T: Schema> ObjectMarshaller<T> for PropertiesMarshaller<T> {
    fn type_name(&self) -> &str {
        T::TYPE_NAME
    }

    fn encode(&self, object: &T) -> Properties {
        let mut properties = Properties::new();
        properties.insert(CANONICAL_NAME_KEY.to_owned(), T::TYPE_NAME.to_owned());
        for field in &self.fields {
            properties.insert(field.name().to_owned(), field.get(object));
        }
        properties
    }

    fn decode(&self, properties: &Properties) -> CacheEntry<T> {
        let found = properties
            .get(CANONICAL_NAME_KEY)
            .ok_or(CacheError::MissingTypeIdentity)?;
        if found != T::TYPE_NAME {
            return Err(CacheError::TypeMismatch {
                expected: T::TYPE_NAME.to_owned(),
                found: found.clone(),
            });
        }

        let mut object = T::default();
        for (name, value) in properties {
            if name == CANONICAL_NAME_KEY {
                continue;
            }
            match self.fields.iter().find(|field| field.name() == name) {
                Some(field) => field.set(&mut object, value)?,
                None => tracing::debug!(
                    property = %name,
                    r#type = T::TYPE_NAME,
                    "Ignoring unknown property"
                ),
            }
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Everything {
        text: String,
        byte: i8,
        short: i16,
        int: i32,
        long: i64,
        float: f32,
        double: f64,
        flag: bool,
        letter: char,
    }

    // Declared by hand to exercise `Field::new` directly.
    impl Schema for Everything {
        const TYPE_NAME: &'static str = "tests.Everything";

        fn fields() -> Vec<Field<Self>> {
            vec![
                Field::new("text", |o: &Self| o.text.clone(), |o, v| o.text = v),
                Field::new("byte", |o: &Self| o.byte, |o, v| o.byte = v),
                Field::new("short", |o: &Self| o.short, |o, v| o.short = v),
                Field::new("int", |o: &Self| o.int, |o, v| o.int = v),
                Field::new("long", |o: &Self| o.long, |o, v| o.long = v),
                Field::new("float", |o: &Self| o.float, |o, v| o.float = v),
                Field::new("double", |o: &Self| o.double, |o, v| o.double = v),
                Field::new("flag", |o: &Self| o.flag, |o, v| o.flag = v),
                Field::new("letter", |o: &Self| o.letter, |o, v| o.letter = v),
            ]
        }
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Pair {
        first: String,
        second: i64,
    }

    crate::schema!(Pair as "tests.Pair" {
        first: String,
        second: i64,
    });

    fn everything() -> Everything {
        Everything {
            text: "multi\nline = value: with #specials".into(),
            byte: i8::MIN,
            short: -1234,
            int: i32::MAX,
            long: i64::MIN,
            float: 0.1,
            double: -2.5e-300,
            flag: true,
            letter: 'ß',
        }
    }

    #[test]
    fn test_round_trip() {
        let marshaller = PropertiesMarshaller::<Everything>::new();
        let object = everything();

        let encoded = marshaller.encode(&object);
        assert_eq!(encoded[CANONICAL_NAME_KEY], "tests.Everything");
        assert_eq!(encoded.len(), 10);

        assert_eq!(marshaller.decode(&encoded).unwrap(), object);
    }

    #[test]
    fn test_round_trip_through_text() {
        let marshaller = PropertiesMarshaller::<Everything>::new();
        let object = everything();

        let text = properties::to_string(&marshaller.encode(&object));
        let parsed = properties::parse(text.as_bytes()).unwrap();

        assert_eq!(marshaller.decode(&parsed).unwrap(), object);
    }

    #[test]
    fn test_schema_macro() {
        let marshaller = PropertiesMarshaller::<Pair>::default();
        let pair = Pair {
            first: "a".into(),
            second: 42,
        };

        let encoded = marshaller.encode(&pair);
        let keys: Vec<_> = encoded.keys().map(String::as_str).collect();
        assert_eq!(keys, ["canonicalName", "first", "second"]);
        assert_eq!(marshaller.decode(&encoded).unwrap(), pair);
    }

    #[test]
    fn test_missing_type_identity() {
        let marshaller = PropertiesMarshaller::<Pair>::new();
        let mut encoded = marshaller.encode(&Pair::default());
        encoded.remove(CANONICAL_NAME_KEY);

        assert_eq!(
            marshaller.decode(&encoded),
            Err(CacheError::MissingTypeIdentity)
        );
    }

    #[test]
    fn test_type_mismatch() {
        let encoded = PropertiesMarshaller::<Pair>::new().encode(&Pair::default());
        let err = PropertiesMarshaller::<Everything>::new()
            .decode(&encoded)
            .unwrap_err();

        assert_eq!(
            err,
            CacheError::TypeMismatch {
                expected: "tests.Everything".into(),
                found: "tests.Pair".into(),
            }
        );
    }

    #[test]
    fn test_unsupported_value() {
        let marshaller = PropertiesMarshaller::<Pair>::new();
        let mut encoded = marshaller.encode(&Pair::default());
        encoded.insert("second".into(), "forty-two".into());

        let err = marshaller.decode(&encoded).unwrap_err();
        assert!(matches!(
            err,
            CacheError::UnsupportedFieldType { ref field, .. } if field == "second"
        ));
    }

    #[test]
    fn test_unknown_and_missing_properties() {
        let marshaller = PropertiesMarshaller::<Pair>::new();
        let mut encoded = marshaller.encode(&Pair {
            first: "x".into(),
            second: 7,
        });
        encoded.remove("second");
        encoded.insert("third".into(), "ignored".into());

        let decoded = marshaller.decode(&encoded).unwrap();
        assert_eq!(
            decoded,
            Pair {
                first: "x".into(),
                second: 0,
            }
        );
    }

    #[test]
    fn test_codecs() {
        assert_eq!(bool::from_property("TRUE"), Ok(true));
        assert_eq!(bool::from_property("False"), Ok(false));
        assert!(bool::from_property("yes").is_err());

        assert_eq!(char::from_property("B"), Ok('B'));
        assert!(char::from_property("").is_err());
        assert!(char::from_property("AB").is_err());

        assert_eq!(i8::from_property("-128"), Ok(-128));
        assert!(i8::from_property("128").is_err());
        assert!(i32::from_property(" 1").is_err());

        assert_eq!(f64::from_property(&0.1f64.to_property()), Ok(0.1));
        assert!(f64::from_property("NaN").unwrap().is_nan());
    }
}
