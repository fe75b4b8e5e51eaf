//! IMISC argument, result, and error parameter types.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Seconds between 1900-01-01T00:00:00Z and the Unix epoch (RFC 868).
pub const EPOCH_1900_OFFSET: i64 = 2_208_988_800;

/// UTCTime layout: two-digit year, seconds precision, literal `Z`.
const UTC_TIME_FORMAT: &str = "%y%m%d%H%M%SZ";
/// GeneralizedTime layout: four-digit year, millisecond fraction, literal `Z`.
const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3fZ";

// ---------------------------------------------------------------------------
// Ia5List
// ---------------------------------------------------------------------------

/// A string that is not representable in the IA5 (7-bit ASCII) alphabet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("element {index} is not an IA5 string")]
pub struct NotIa5 {
    pub index: usize,
}

/// Sequence of IA5 (7-bit ASCII) strings.
///
/// Decoding rejects non-ASCII elements, so a performer never sees a list
/// that violates the alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Ia5List(Vec<String>);

impl Ia5List {
    /// Builds a list, failing on the first non-ASCII element.
    ///
    /// # Errors
    ///
    /// Returns `NotIa5` naming the offending element.
    pub fn new<I, S>(items: I) -> Result<Self, NotIa5>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        if let Some(index) = items.iter().position(|s| !s.is_ascii()) {
            return Err(NotIa5 { index });
        }
        Ok(Self(items))
    }

    /// Builds a list, replacing every non-ASCII character with `?`.
    pub fn lossy<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            items
                .into_iter()
                .map(|s| {
                    s.as_ref()
                        .chars()
                        .map(|c| if c.is_ascii() { c } else { '?' })
                        .collect()
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl TryFrom<Vec<String>> for Ia5List {
    type Error = NotIa5;

    fn try_from(items: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(items)
    }
}

impl From<Ia5List> for Vec<String> {
    fn from(list: Ia5List) -> Self {
        list.0
    }
}

/// Elements separated by `", "`.
impl std::fmt::Display for Ia5List {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(item)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Ia5List {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Time results
// ---------------------------------------------------------------------------

/// UTCTime string, e.g. `"231114221320Z"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtcResult(pub String);

impl UtcResult {
    #[must_use]
    pub fn from_datetime(at: &DateTime<Utc>) -> Self {
        Self(at.format(UTC_TIME_FORMAT).to_string())
    }

    /// Parses the UTCTime back into an instant. Two-digit years 69 to 99 map to
    /// the twentieth century, 00 to 68 to the twenty-first.
    ///
    /// # Errors
    ///
    /// Returns the chrono parse error for malformed strings.
    pub fn to_datetime(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(&self.0, UTC_TIME_FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
    }
}

/// Seconds since 1900-01-01T00:00:00Z, as the TIME protocol reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeResult(pub i64);

impl TimeResult {
    #[must_use]
    pub fn from_datetime(at: &DateTime<Utc>) -> Self {
        Self(at.timestamp() + EPOCH_1900_OFFSET)
    }

    /// Converts back to an instant; `None` if out of chrono's range.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.0 - EPOCH_1900_OFFSET, 0)
    }
}

/// GeneralizedTime string, e.g. `"20231114221320.123Z"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenResult(pub String);

impl GenResult {
    #[must_use]
    pub fn from_datetime(at: &DateTime<Utc>) -> Self {
        Self(at.format(GENERALIZED_TIME_FORMAT).to_string())
    }

    /// # Errors
    ///
    /// Returns the chrono parse error for malformed strings.
    pub fn to_datetime(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(&self.0, GENERALIZED_TIME_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

// ---------------------------------------------------------------------------
// Data / Empty
// ---------------------------------------------------------------------------

/// Arbitrary value (ASN.1 `ANY`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data(pub rmpv::Value);

impl Data {
    /// Approximate encoded size, used for accounting in `sink`.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut buf = Vec::new();
        match rmpv::encode::write_value(&mut buf, &self.0) {
            Ok(()) => buf.len(),
            Err(_) => 0,
        }
    }
}

impl From<rmpv::Value> for Data {
    fn from(value: rmpv::Value) -> Self {
        Self(value)
    }
}

/// The `NULL` argument or result. Encodes as `MsgPack` nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Empty;

impl Serialize for Empty {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for Empty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EmptyVisitor;

        impl<'de> Visitor<'de> for EmptyVisitor {
            type Value = Empty;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("nil")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Empty, E> {
                Ok(Empty)
            }

            fn visit_none<E: de::Error>(self) -> Result<Empty, E> {
                Ok(Empty)
            }

            // Older peers send an empty array.
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Empty, A::Error> {
                match seq.next_element::<de::IgnoredAny>()? {
                    None => Ok(Empty),
                    Some(_) => Err(de::Error::invalid_length(1, &self)),
                }
            }
        }

        deserializer.deserialize_any(EmptyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::codec::{decode_payload, encode_payload};

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap()
            + chrono::Duration::milliseconds(123)
    }

    #[test]
    fn ia5_list_rejects_non_ascii() {
        assert_eq!(Ia5List::new(["ok", "caf\u{e9}"]), Err(NotIa5 { index: 1 }));
        assert_eq!(Ia5List::new(["a", "b"]).unwrap().len(), 2);
    }

    #[test]
    fn ia5_list_decoding_enforces_alphabet() {
        let bytes = encode_payload(&vec!["na\u{ef}ve".to_string()]).unwrap();
        assert!(decode_payload::<Ia5List>(&bytes).is_err());

        let bytes = encode_payload(&vec!["plain".to_string()]).unwrap();
        let list: Ia5List = decode_payload(&bytes).unwrap();
        assert_eq!(list.as_slice(), ["plain".to_string()]);
    }

    #[test]
    fn ia5_list_lossy_replaces() {
        let list = Ia5List::lossy(["h\u{e9}llo"]);
        assert_eq!(list.as_slice(), ["h?llo".to_string()]);
    }

    #[test]
    fn utc_time_format() {
        let utc = UtcResult::from_datetime(&instant());
        assert_eq!(utc.0, "231114221320Z");
        assert_eq!(
            utc.to_datetime().unwrap(),
            Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap()
        );
    }

    #[test]
    fn generalized_time_format_keeps_millis() {
        let gen = GenResult::from_datetime(&instant());
        assert_eq!(gen.0, "20231114221320.123Z");
        assert_eq!(gen.to_datetime().unwrap(), instant());
    }

    #[test]
    fn time_of_day_uses_1900_epoch() {
        let epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(TimeResult::from_datetime(&epoch), TimeResult(EPOCH_1900_OFFSET));
        assert_eq!(TimeResult(EPOCH_1900_OFFSET).to_datetime(), Some(epoch));
    }

    #[test]
    fn empty_encodes_as_nil() {
        let bytes = encode_payload(&Empty).unwrap();
        assert_eq!(bytes, vec![0xC0]);
        assert_eq!(decode_payload::<Empty>(&bytes).unwrap(), Empty);
        assert_eq!(decode_payload::<Empty>(&[0x90]).unwrap(), Empty);
        assert!(decode_payload::<Empty>(&[0x91, 0x01]).is_err());
        assert!(decode_payload::<Empty>(&[0x07]).is_err());
    }

    #[test]
    fn ia5_list_displays_as_plain_text() {
        assert_eq!(Ia5List::new(["bob", "alice"]).unwrap().to_string(), "bob, alice");
        assert_eq!(Ia5List::default().to_string(), "");
    }

    #[test]
    fn data_carries_any_value() {
        let data = Data(rmpv::Value::Array(vec![
            rmpv::Value::from(1),
            rmpv::Value::from("two"),
        ]));
        let bytes = encode_payload(&data).unwrap();
        assert_eq!(decode_payload::<Data>(&bytes).unwrap(), data);
        assert!(data.encoded_len() > 0);
    }
}
