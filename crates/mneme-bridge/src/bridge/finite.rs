//! Rejects non-finite floats before they reach `serde_json`.
//!
//! `serde_json` writes NaN and infinities as `null`, which would hand the
//! worker a different value than the caller supplied. [`ensure_finite`] walks
//! a value through a serializer that produces nothing and fails on the first
//! non-finite float, naming the field it sits in.

use std::fmt;

use serde::Serialize;
use serde::ser;

use crate::error::BridgeError;

/// Fail with `Encoding` if `value` contains NaN or an infinity.
pub fn ensure_finite<T: Serialize + ?Sized>(value: &T) -> Result<(), BridgeError> {
    value
        .serialize(&mut FiniteCheck::default())
        .map_err(|e| BridgeError::Encoding(e.0))
}

#[derive(Debug)]
pub struct NonFinite(String);

impl fmt::Display for NonFinite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NonFinite {}

impl ser::Error for NonFinite {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

#[derive(Default)]
struct FiniteCheck {
    /// Field names from the root to the value being visited.
    path: Vec<&'static str>,
}

impl FiniteCheck {
    fn float(&self, v: f64) -> Result<(), NonFinite> {
        if v.is_finite() {
            return Ok(());
        }
        Err(NonFinite(if self.path.is_empty() {
            format!("non-finite number {v} cannot be encoded as JSON")
        } else {
            format!(
                "non-finite number {v} in `{}` cannot be encoded as JSON",
                self.path.join(".")
            )
        }))
    }

    fn field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), NonFinite> {
        self.path.push(key);
        let result = value.serialize(&mut *self);
        self.path.pop();
        result
    }
}

type Checked = Result<(), NonFinite>;

impl<'a> ser::Serializer for &'a mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Checked {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Checked {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Checked {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Checked {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Checked {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Checked {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Checked {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Checked {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Checked {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Checked {
        self.float(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Checked {
        self.float(v)
    }
    fn serialize_char(self, _: char) -> Checked {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Checked {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Checked {
        Ok(())
    }
    fn serialize_none(self) -> Checked {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Checked {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Checked {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Checked {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Checked {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Checked {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Checked {
        self.field(variant, value)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        self.path.push(variant);
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        self.path.push(variant);
        Ok(self)
    }
}

impl ser::SerializeSeq for &mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(&mut **self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeTuple for &mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(&mut **self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for &mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(&mut **self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for &mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(&mut **self)
    }
    fn end(self) -> Checked {
        self.path.pop();
        Ok(())
    }
}

impl ser::SerializeMap for &mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Checked {
        key.serialize(&mut **self)
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(&mut **self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeStruct for &mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Checked {
        self.field(key, value)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeStructVariant for &mut FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Checked {
        self.field(key, value)
    }
    fn end(self) -> Checked {
        self.path.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{AddFactor, Search, SetScore};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn finite_params_pass() {
        let params = SetScore {
            choice_id: 1,
            factor_id: 2,
            score: 7.5,
            uncertainty: Some(0.5),
            notes: Some("gut feeling".into()),
        };
        assert_eq!(ensure_finite(&params), Ok(()));
        assert_eq!(ensure_finite(&json!({"a": [1, 2.5, {"b": null}]})), Ok(()));
    }

    #[test]
    fn nan_score_is_an_encoding_error() {
        let params = SetScore {
            choice_id: 1,
            factor_id: 2,
            score: f64::NAN,
            uncertainty: None,
            notes: None,
        };
        let err = ensure_finite(&params).unwrap_err();
        assert_eq!(
            err,
            BridgeError::Encoding("non-finite number NaN in `score` cannot be encoded as JSON".into())
        );
    }

    #[test]
    fn infinities_in_optional_fields_are_rejected() {
        let factor = AddFactor {
            decision_id: 1,
            name: "cost".into(),
            weight: Some(f64::INFINITY),
            description: None,
        };
        assert!(matches!(ensure_finite(&factor), Err(BridgeError::Encoding(m)) if m.contains("`weight`")));

        let search = Search {
            query: "q".into(),
            limit: None,
            min_similarity: Some(f64::NEG_INFINITY),
        };
        assert!(matches!(ensure_finite(&search), Err(BridgeError::Encoding(_))));
    }

    #[test]
    fn nested_collections_are_walked() {
        let mut map = BTreeMap::new();
        map.insert("weights", vec![1.0_f32, f32::NAN]);
        assert!(matches!(ensure_finite(&map), Err(BridgeError::Encoding(_))));
        assert!(matches!(ensure_finite(&(1, f64::INFINITY)), Err(BridgeError::Encoding(_))));
    }
}
