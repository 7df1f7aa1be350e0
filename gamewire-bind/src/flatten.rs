//! Flattening typed values into argument bags.
//!
//! Flattening drives a custom `serde::Serializer` that writes one bag entry
//! per leaf:
//! - record fields become `prefix.field`
//! - list and set elements become `prefix[i]`
//! - map entries become `prefix.@.key`
//! - enum variants nest under their variant name
//!
//! Empty lists, maps and records are written as empty JSON containers so
//! they survive the trip back.
//!
//! While a value is being serialized its address and type stay in an
//! ancestry set. Meeting the same pair again below itself means the graph
//! refers back to an ancestor, which is rejected with
//! [`BindError::SelfReference`]. Zero-sized values have no identity and are
//! never tracked.

use crate::bag::ArgumentBag;
use crate::error::BindError;
use crate::path;
use serde::ser::{
    SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
    SerializeTupleStruct, SerializeTupleVariant, Serializer,
};
use serde::Serialize;
use serde_json::{Map, Value};

/// Flattens `value` into a new bag rooted at the empty path.
pub fn to_bag<T: ?Sized + Serialize>(value: &T) -> Result<ArgumentBag, BindError> {
    to_bag_at("", value)
}

/// Flattens `value` into a new bag with every path under `prefix`.
pub fn to_bag_at<T: ?Sized + Serialize>(prefix: &str, value: &T) -> Result<ArgumentBag, BindError> {
    Flattener::new(crate::DEFAULT_MAX_DEPTH).flatten(prefix, value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Visit {
    addr: usize,
    type_name: &'static str,
}

impl Visit {
    fn of<T: ?Sized>(value: &T) -> Option<Self> {
        if std::mem::size_of_val(value) == 0 {
            return None;
        }
        Some(Self {
            addr: value as *const T as *const () as usize,
            type_name: std::any::type_name::<T>(),
        })
    }
}

pub(crate) struct Flattener {
    bag: ArgumentBag,
    ancestry: Vec<Visit>,
    depth: usize,
    max_depth: usize,
}

impl Flattener {
    pub(crate) fn new(max_depth: usize) -> Self {
        Self {
            bag: ArgumentBag::new(),
            ancestry: Vec::new(),
            depth: 0,
            max_depth,
        }
    }

    pub(crate) fn flatten<T: ?Sized + Serialize>(
        mut self,
        prefix: &str,
        value: &T,
    ) -> Result<ArgumentBag, BindError> {
        self.visit(prefix.to_string(), value)?;
        Ok(self.bag)
    }

    fn visit<T: ?Sized + Serialize>(&mut self, path: String, value: &T) -> Result<(), BindError> {
        let visit = Visit::of(value);
        if let Some(visit) = visit {
            if self.ancestry.contains(&visit) {
                return Err(BindError::SelfReference { path });
            }
        }
        if self.depth >= self.max_depth {
            return Err(BindError::DepthExceeded {
                path,
                max: self.max_depth,
            });
        }

        if let Some(visit) = visit {
            self.ancestry.push(visit);
        }
        self.depth += 1;

        let result = value.serialize(PathSerializer {
            flattener: &mut *self,
            path,
        });

        self.depth -= 1;
        if visit.is_some() {
            self.ancestry.pop();
        }
        result
    }

    fn leaf(&mut self, path: String, value: Value) -> Result<(), BindError> {
        self.bag.insert(path, value);
        Ok(())
    }
}

struct PathSerializer<'a> {
    flattener: &'a mut Flattener,
    path: String,
}

impl<'a> PathSerializer<'a> {
    fn compound(self, path: String) -> Compound<'a> {
        Compound {
            flattener: self.flattener,
            path,
            count: 0,
            key: None,
        }
    }
}

impl<'a> Serializer for PathSerializer<'a> {
    type Ok = ();
    type Error = BindError;
    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = Compound<'a>;
    type SerializeMap = Compound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = Compound<'a>;

    fn serialize_bool(self, v: bool) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Self::Ok, Self::Error> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::from(v))
    }

    fn serialize_u8(self, v: u8) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Self::Ok, Self::Error> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::from(v))
    }

    fn serialize_f32(self, v: f32) -> Result<Self::Ok, Self::Error> {
        self.serialize_f64(f64::from(v))
    }

    // Non-finite floats become null, as in JSON.
    fn serialize_f64(self, v: f64) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::from(v))
    }

    fn serialize_char(self, v: char) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Self::Ok, Self::Error> {
        let items = v.iter().map(|b| Value::from(*b)).collect();
        self.flattener.leaf(self.path, Value::Array(items))
    }

    fn serialize_none(self) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Self::Ok, Self::Error> {
        self.flattener.visit(self.path, value)
    }

    fn serialize_unit(self) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Self::Ok, Self::Error> {
        self.flattener.leaf(self.path, Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Self::Ok, Self::Error> {
        self.flattener
            .leaf(self.path, Value::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error> {
        self.flattener.visit(self.path, value)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Self::Ok, Self::Error> {
        let path = path::field(&self.path, variant);
        self.flattener.visit(path, value)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        let path = self.path.clone();
        Ok(self.compound(path))
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple, Self::Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        let path = path::field(&self.path, variant);
        Ok(self.compound(path))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        let path = self.path.clone();
        Ok(self.compound(path))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Self::Error> {
        let path = self.path.clone();
        Ok(self.compound(path))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        let path = path::field(&self.path, variant);
        Ok(self.compound(path))
    }
}

struct Compound<'a> {
    flattener: &'a mut Flattener,
    path: String,
    count: usize,
    key: Option<String>,
}

impl Compound<'_> {
    fn element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), BindError> {
        let path = path::index(&self.path, self.count);
        self.count += 1;
        self.flattener.visit(path, value)
    }

    fn field<T: ?Sized + Serialize>(&mut self, name: &str, value: &T) -> Result<(), BindError> {
        self.count += 1;
        self.flattener.visit(path::field(&self.path, name), value)
    }

    fn end_with(self, empty: Value) -> Result<(), BindError> {
        if self.count == 0 {
            self.flattener.leaf(self.path, empty)
        } else {
            Ok(())
        }
    }
}

fn map_key<K: ?Sized + Serialize>(prefix: &str, key: &K) -> Result<String, BindError> {
    let invalid = |reason: String| BindError::MapKey {
        path: prefix.to_string(),
        reason,
    };
    let key = match serde_json::to_value(key).map_err(|e| invalid(e.to_string()))? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => return Err(invalid(format!("{other} is not a scalar"))),
    };
    if !path::valid_map_key(&key) {
        return Err(invalid(format!("'{key}' contains a path separator or is empty")));
    }
    Ok(key)
}

impl SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = BindError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.element(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.end_with(Value::Array(Vec::new()))
    }
}

impl SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = BindError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.element(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.end_with(Value::Array(Vec::new()))
    }
}

impl SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = BindError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.element(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.end_with(Value::Array(Vec::new()))
    }
}

impl SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = BindError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.element(value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.end_with(Value::Array(Vec::new()))
    }
}

impl SerializeMap for Compound<'_> {
    type Ok = ();
    type Error = BindError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Self::Error> {
        self.key = Some(map_key(&self.path, key)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        let key = self
            .key
            .take()
            .ok_or_else(|| BindError::Custom("map value without a key".to_string()))?;
        self.count += 1;
        self.flattener
            .visit(path::map_entry(&self.path, &key), value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.end_with(Value::Object(Map::new()))
    }
}

impl SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = BindError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        self.field(key, value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.end_with(Value::Object(Map::new()))
    }
}

impl SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = BindError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        self.field(key, value)
    }

    fn end(self) -> Result<Self::Ok, Self::Error> {
        self.end_with(Value::Object(Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[derive(Serialize)]
    struct Card {
        code: i32,
    }

    #[derive(Serialize)]
    struct Enter {
        code: i32,
        name: String,
        cards: Vec<Card>,
    }

    #[test]
    fn test_flatten_record_with_list() {
        let bag = to_bag(&Enter {
            code: 1,
            name: "x".to_string(),
            cards: vec![Card { code: 2 }, Card { code: 3 }],
        })
        .unwrap();

        assert_eq!(bag.len(), 4);
        assert_eq!(bag.get("code"), Some(&json!(1)));
        assert_eq!(bag.get("name"), Some(&json!("x")));
        assert_eq!(bag.get("cards[0].code"), Some(&json!(2)));
        assert_eq!(bag.get("cards[1].code"), Some(&json!(3)));
    }

    #[test]
    fn test_flatten_at_prefix() {
        let bag = to_bag_at("card", &Card { code: 7 }).unwrap();
        assert_eq!(bag.get("card.code"), Some(&json!(7)));

        let bag = to_bag_at("code", &5).unwrap();
        assert_eq!(bag.get("code"), Some(&json!(5)));
    }

    #[test]
    fn test_flatten_map_uses_marker() {
        let mut scores = BTreeMap::new();
        scores.insert("alice".to_string(), 10);
        scores.insert("bob".to_string(), 20);

        let bag = to_bag_at("scores", &scores).unwrap();
        assert_eq!(bag.get("scores.@.alice"), Some(&json!(10)));
        assert_eq!(bag.get("scores.@.bob"), Some(&json!(20)));
    }

    #[test]
    fn test_flatten_integer_map_keys() {
        let mut levels = BTreeMap::new();
        levels.insert(3, "gold");

        let bag = to_bag_at("levels", &levels).unwrap();
        assert_eq!(bag.get("levels.@.3"), Some(&json!("gold")));
    }

    #[test]
    fn test_flatten_rejects_dotted_map_key() {
        let mut map = BTreeMap::new();
        map.insert("a.b".to_string(), 1);

        assert!(matches!(to_bag(&map), Err(BindError::MapKey { .. })));
    }

    #[test]
    fn test_flatten_empty_containers() {
        #[derive(Serialize)]
        struct Holder {
            items: Vec<i32>,
            tags: BTreeMap<String, i32>,
        }

        let bag = to_bag(&Holder {
            items: vec![],
            tags: BTreeMap::new(),
        })
        .unwrap();
        assert_eq!(bag.get("items"), Some(&json!([])));
        assert_eq!(bag.get("tags"), Some(&json!({})));
    }

    #[test]
    fn test_flatten_options_and_enums() {
        #[derive(Serialize)]
        enum Action {
            Fold,
            Bet(u32),
            Move { x: i32, y: i32 },
        }

        #[derive(Serialize)]
        struct Turn {
            nickname: Option<String>,
            actions: Vec<Action>,
        }

        let bag = to_bag(&Turn {
            nickname: None,
            actions: vec![Action::Fold, Action::Bet(50), Action::Move { x: 1, y: -1 }],
        })
        .unwrap();

        assert_eq!(bag.get("nickname"), Some(&Value::Null));
        assert_eq!(bag.get("actions[0]"), Some(&json!("Fold")));
        assert_eq!(bag.get("actions[1].Bet"), Some(&json!(50)));
        assert_eq!(bag.get("actions[2].Move.x"), Some(&json!(1)));
        assert_eq!(bag.get("actions[2].Move.y"), Some(&json!(-1)));
    }

    #[derive(Serialize)]
    struct Node {
        name: String,
        next: Option<Rc<RefCell<Node>>>,
    }

    #[test]
    fn test_self_reference_rejected() {
        let node = Rc::new(RefCell::new(Node {
            name: "loop".to_string(),
            next: None,
        }));
        node.borrow_mut().next = Some(Rc::clone(&node));

        let result = to_bag(&node);
        assert!(matches!(result, Err(BindError::SelfReference { .. })));

        // Break the cycle so the test does not leak
        node.borrow_mut().next = None;
    }

    #[test]
    fn test_indirect_cycle_rejected() {
        let a = Rc::new(RefCell::new(Node {
            name: "a".to_string(),
            next: None,
        }));
        let b = Rc::new(RefCell::new(Node {
            name: "b".to_string(),
            next: Some(Rc::clone(&a)),
        }));
        a.borrow_mut().next = Some(Rc::clone(&b));

        let result = to_bag(&a);
        match result {
            Err(BindError::SelfReference { path }) => assert!(path.starts_with("next.next")),
            other => panic!("expected self reference, got {other:?}"),
        }

        a.borrow_mut().next = None;
    }

    #[test]
    fn test_shared_reference_is_not_a_cycle() {
        #[derive(Serialize)]
        struct Pair {
            left: Rc<Card>,
            right: Rc<Card>,
        }

        let card = Rc::new(Card { code: 9 });
        let bag = to_bag(&Pair {
            left: Rc::clone(&card),
            right: card,
        })
        .unwrap();

        assert_eq!(bag.get("left.code"), Some(&json!(9)));
        assert_eq!(bag.get("right.code"), Some(&json!(9)));
    }

    #[test]
    fn test_depth_limit() {
        let nested = vec![vec![vec![1]]];
        let result = Flattener::new(2).flatten("", &nested);
        assert!(matches!(result, Err(BindError::DepthExceeded { max: 2, .. })));

        let bag = Flattener::new(4).flatten("", &nested).unwrap();
        assert_eq!(bag.get("[0][0][0]"), Some(&json!(1)));
    }
}
