//! Shape-checked numeric arrays.
//!
//! Accepts the two shapes numeric data takes in the dataset's pickles: nested
//! Python lists and pickled `numpy.ndarray`s. An ndarray reaches the decoder as
//! its reconstruction state `(version, shape, dtype, fortran_order, raw_bytes)`.
//! The dtype's type string does not survive decoding (only its byte order, and
//! only where the dtype is not a memo back-reference), so the element type is
//! inferred from the byte width per element:
//!
//! * 8 bytes: `i8` when every word is below 2^52 in magnitude, else `f8`;
//! * 4 bytes: `i4` when every word is below 2^23 in magnitude, else `f4`;
//! * 1 byte: `u1` / `b1`.
//!
//! Any finite non-zero IEEE value sets exponent bits that put its word above
//! those limits, so the rule only misreads subnormal floats and integers past
//! the limit.

use std::fmt;

use serde::de::{self, Error as _, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const INT64_LIMIT: u64 = 1 << 52;
const INT32_LIMIT: u32 = 1 << 23;

/// Dense row-major array of `f64` with an explicit shape.
///
/// Deserializes from a scalar, arbitrarily nested rectangular lists or a
/// pickled ndarray, and serializes to nested lists.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// Untyped pickle value, as much of it as numeric data can contain.
#[derive(Debug)]
enum Node {
    Num(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    Null,
    Seq(Vec<Node>),
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::Num(_) => "number",
            Node::Bool(_) => "bool",
            Node::Bytes(_) => "bytes",
            Node::Text(_) => "string",
            Node::Null => "None",
            Node::Seq(_) => "sequence",
        }
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a number, a nested list of numbers or a numpy array")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Node, E> {
        Ok(Node::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Node, E> {
        Ok(Node::Num(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Node, E> {
        Ok(Node::Num(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Node, E> {
        Ok(Node::Num(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
        Ok(Node::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
        Ok(Node::Text(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Node, E> {
        Ok(Node::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Node, E> {
        Ok(Node::Bytes(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Node, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Node, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Node>()? {
            items.push(item);
        }
        Ok(Node::Seq(items))
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

impl NumericArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Option<Self> {
        let expected: usize = shape.iter().product();
        (expected == data.len()).then_some(Self { shape, data })
    }

    pub fn from_rows<const N: usize>(rows: &[[f64; N]]) -> Self {
        Self {
            shape: vec![rows.len(), N],
            data: rows.iter().flatten().copied().collect(),
        }
    }

    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row `i` of a 2-D array.
    pub fn row(&self, i: usize) -> Option<&[f64]> {
        match self.shape.as_slice() {
            [rows, cols] if i < *rows => Some(&self.data[i * cols..(i + 1) * cols]),
            _ => None,
        }
    }

    fn from_node(node: Node) -> Result<Self, String> {
        if let Node::Seq(items) = &node {
            if let [Node::Num(_), Node::Seq(shape), dtype, Node::Bool(fortran), Node::Bytes(raw)] =
                items.as_slice()
            {
                return Self::from_ndarray_state(shape, dtype, *fortran, raw);
            }
        }

        let mut shape = Vec::new();
        let mut first = &node;
        while let Node::Seq(items) = first {
            shape.push(items.len());
            match items.first() {
                Some(item) => first = item,
                None => break,
            }
        }

        let mut data = Vec::new();
        flatten(&node, &shape, 0, &mut data)?;
        Ok(Self { shape, data })
    }

    fn from_ndarray_state(shape: &[Node], dtype: &Node, fortran: bool, raw: &[u8]) -> Result<Self, String> {
        let shape = shape
            .iter()
            .map(|dim| match dim {
                Node::Num(v) if *v >= 0.0 && v.fract() == 0.0 => Ok(*v as usize),
                other => Err(format!("ndarray dimension must be a non-negative integer, got {}", other.kind())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let count: usize = shape.iter().product();

        // dtype state: (version, byte_order, subarray, names, fields, elsize, alignment, flags)
        let big_endian = match dtype {
            Node::Seq(state) => matches!(state.get(1), Some(Node::Text(order)) if order == ">"),
            _ => false,
        };

        let data = decode_elements(raw, count, big_endian)?;
        let data = if fortran { fortran_to_row_major(&shape, &data) } else { data };
        Ok(Self { shape, data })
    }
}

fn flatten(node: &Node, shape: &[usize], depth: usize, out: &mut Vec<f64>) -> Result<(), String> {
    let value = match node {
        Node::Seq(items) => {
            if shape.get(depth) != Some(&items.len()) {
                return Err(format!("ragged array at depth {}", depth));
            }
            for item in items {
                flatten(item, shape, depth + 1, out)?;
            }
            return Ok(());
        }
        Node::Num(v) => *v,
        Node::Bool(v) => f64::from(u8::from(*v)),
        other => return Err(format!("unexpected {} in numeric array", other.kind())),
    };
    if depth != shape.len() {
        return Err(format!("scalar at depth {} in array of rank {}", depth, shape.len()));
    }
    out.push(value);
    Ok(())
}

/// Fixed-width words of `raw`, reordered to little-endian.
fn words<const N: usize>(raw: &[u8], big_endian: bool) -> impl Iterator<Item = [u8; N]> + '_ {
    raw.chunks_exact(N).map(move |chunk| {
        let mut word = [0u8; N];
        word.copy_from_slice(chunk);
        if big_endian {
            word.reverse();
        }
        word
    })
}

fn decode_elements(raw: &[u8], count: usize, big_endian: bool) -> Result<Vec<f64>, String> {
    if count == 0 {
        return if raw.is_empty() {
            Ok(Vec::new())
        } else {
            Err(format!("{} bytes of data for an empty ndarray", raw.len()))
        };
    }
    if raw.len() % count != 0 {
        return Err(format!("{} bytes do not split into {} elements", raw.len(), count));
    }

    let data = match raw.len() / count {
        8 => {
            let bits: Vec<i64> = words::<8>(raw, big_endian).map(i64::from_le_bytes).collect();
            if bits.iter().all(|b| b.unsigned_abs() < INT64_LIMIT) {
                bits.into_iter().map(|b| b as f64).collect()
            } else {
                bits.into_iter().map(|b| f64::from_bits(b as u64)).collect()
            }
        }
        4 => {
            let bits: Vec<i32> = words::<4>(raw, big_endian).map(i32::from_le_bytes).collect();
            if bits.iter().all(|b| b.unsigned_abs() < INT32_LIMIT) {
                bits.into_iter().map(f64::from).collect()
            } else {
                bits.into_iter().map(|b| f64::from(f32::from_bits(b as u32))).collect()
            }
        }
        1 => raw.iter().copied().map(f64::from).collect(),
        width => return Err(format!("unsupported ndarray element width {}", width)),
    };
    Ok(data)
}

/// Reorders column-major `data` into row-major order.
fn fortran_to_row_major(shape: &[usize], data: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(data.len());
    let mut index = vec![0usize; shape.len()];
    for _ in 0..data.len() {
        let mut offset = 0;
        let mut stride = 1;
        for (i, dim) in index.iter().zip(shape) {
            offset += i * stride;
            stride *= dim;
        }
        out.push(data[offset]);

        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

impl<'de> Deserialize<'de> for NumericArray {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let node = Node::deserialize(deserializer)?;
        NumericArray::from_node(node).map_err(D::Error::custom)
    }
}

/// Borrowed view of one nesting level during serialization.
struct Level<'a> {
    shape: &'a [usize],
    data: &'a [f64],
}

impl Serialize for Level<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;

        let Some((&len, rest)) = self.shape.split_first() else {
            return serializer.serialize_f64(self.data.first().copied().unwrap_or_default());
        };
        let stride: usize = rest.iter().product();
        let mut seq = serializer.serialize_seq(Some(len))?;
        for i in 0..len {
            seq.serialize_element(&Level {
                shape: rest,
                data: &self.data[i * stride..(i + 1) * stride],
            })?;
        }
        seq.end()
    }
}

impl Serialize for NumericArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Level {
            shape: &self.shape,
            data: &self.data,
        }
        .serialize(serializer)
    }
}
