//! Serde helpers for metadata deserialization.

use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt;
use std::marker::PhantomData;

/// Deserialize a JSON object into a `BTreeMap`, rejecting duplicate keys.
///
/// `serde_json` silently keeps the last value for a repeated key; for signed
/// metadata that would let two parsers disagree about what was signed.
pub(crate) fn unique_map<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
where
    D: Deserializer<'de>,
    K: Deserialize<'de> + Ord + fmt::Display,
    V: Deserialize<'de>,
{
    struct UniqueMapVisitor<K, V>(PhantomData<(K, V)>);

    impl<'de, K, V> Visitor<'de> for UniqueMapVisitor<K, V>
    where
        K: Deserialize<'de> + Ord + fmt::Display,
        V: Deserialize<'de>,
    {
        type Value = BTreeMap<K, V>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map without duplicate keys")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut map = BTreeMap::new();
            while let Some((key, value)) = access.next_entry::<K, V>()? {
                match map.entry(key) {
                    Entry::Occupied(existing) => {
                        return Err(de::Error::custom(format!(
                            "duplicate key `{}`",
                            existing.key()
                        )));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(UniqueMapVisitor(PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "unique_map")]
        meta: BTreeMap<String, u64>,
    }

    #[test]
    fn accepts_distinct_keys() {
        let h: Holder = serde_json::from_str(r#"{"meta": {"a": 1, "b": 2}}"#).unwrap();
        assert_eq!(h.meta.len(), 2);
        assert_eq!(h.meta["b"], 2);
    }

    #[test]
    fn rejects_duplicate_keys() {
        let err = serde_json::from_str::<Holder>(r#"{"meta": {"a": 1, "a": 2}}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate key `a`"), "{}", err);
    }
}
