use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value.
///
/// Extension handshakes and metadata messages are bencoded dictionaries;
/// this type models any of the four bencode kinds and offers typed access.
///
/// # Examples
///
/// ```
/// use peerwire::bencode::Value;
///
/// let reqq: Value = 250i64.into();
/// let client: Value = "peerwire".into();
/// let list = Value::List(vec![reqq.clone(), client.clone()]);
///
/// assert_eq!(reqq.as_integer(), Some(250));
/// assert_eq!(client.as_str(), Some("peerwire"));
/// assert_eq!(list.as_list().map(<[Value]>::len), Some(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string, not necessarily UTF-8.
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys, kept sorted so encoding is
    /// canonical.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerwire::bencode::Value;
    ///
    /// let value = Value::string("ut_metadata");
    /// assert_eq!(value.as_str(), Some("ut_metadata"));
    /// ```
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Returns the value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a byte string, if it is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8, or `None` if it is not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns the value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the value as a dictionary, if it is one.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerwire::bencode::decode;
    ///
    /// let value = decode(b"d1:v8:peerwiree").unwrap();
    /// let dict = value.as_dict().unwrap();
    /// assert!(dict.contains_key(b"v".as_slice()));
    /// ```
    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}
