//! Transferable payload packaging.
//!
//! A task result is a tree of named fields: plain JSON data alongside large
//! typed binary buffers. Before crossing the context boundary the buffers are
//! pulled out into a positional [`TransferList`] so the transport can move
//! them without copying, and each buffer's place in the structure is taken by
//! a [`TransferDescriptor`]. The receiving side reverses the substitution.
//!
//! Transfer is an ownership move, not a share: after move-mode reconstruction
//! the source-side buffer is empty. Clone-mode reconstruction copies instead,
//! leaving the source usable at the cost of a copy.

use std::collections::BTreeMap;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};

/// Element type of a typed binary buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn byte_width(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

/// A binary buffer with its semantic metadata, as produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedBuffer {
    /// Semantic role of the buffer ("positions", "normals", "indices", ...).
    pub role: String,

    pub element_type: ElementType,

    /// Elements per logical record (3 for xyz triples, 1 for scalars).
    pub stride: usize,

    /// Raw little-endian element bytes.
    pub bytes: Vec<u8>,
}

impl TypedBuffer {
    pub fn new(
        role: impl Into<String>,
        element_type: ElementType,
        stride: usize,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            role: role.into(),
            element_type,
            stride,
            bytes,
        }
    }

    /// Pack a float slice into a buffer.
    pub fn from_f32s(role: impl Into<String>, stride: usize, values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(role, ElementType::F32, stride, bytes)
    }

    /// Pack an unsigned-int slice into a buffer.
    pub fn from_u32s(role: impl Into<String>, stride: usize, values: &[u32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(role, ElementType::U32, stride, bytes)
    }

    /// Element count of the buffer.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.element_type.byte_width()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read the buffer back as floats.
    pub fn as_f32s(&self) -> Result<Vec<f32>> {
        if self.element_type != ElementType::F32 {
            return Err(OffloadError::PackagingFailure {
                message: format!(
                    "buffer '{}' holds {:?} elements, not f32",
                    self.role, self.element_type
                ),
            });
        }
        Ok(self
            .bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Read the buffer back as unsigned ints.
    pub fn as_u32s(&self) -> Result<Vec<u32>> {
        if self.element_type != ElementType::U32 {
            return Err(OffloadError::PackagingFailure {
                message: format!(
                    "buffer '{}' holds {:?} elements, not u32",
                    self.role, self.element_type
                ),
            });
        }
        Ok(self
            .bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    fn descriptor(&self, slot: usize) -> TransferDescriptor {
        TransferDescriptor {
            role: self.role.clone(),
            element_type: self.element_type,
            stride: self.stride,
            len: self.len(),
            slot,
        }
    }
}

/// Metadata describing one transferred buffer, paired positionally with the
/// raw bytes moved in the transfer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub role: String,
    pub element_type: ElementType,
    pub stride: usize,
    /// Element count of the buffer.
    pub len: usize,
    /// Position of the buffer in the transfer list.
    pub slot: usize,
}

/// Positional list of raw binary buffers accompanying a message.
pub type TransferList = Vec<Vec<u8>>;

/// One field of a structured task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultField {
    Data { value: serde_json::Value },
    Buffer { buffer: TypedBuffer },
}

/// A structured task result: named fields holding JSON data and typed
/// buffers. Field order is stable (sorted by name), which fixes the slot
/// order of packaged buffers.
///
/// # Examples
///
/// ```
/// use offload_core::{StructuredResult, TypedBuffer};
///
/// let result = StructuredResult::new()
///     .with_data("vertex_count", serde_json::json!(2))
///     .with_buffer(
///         "positions",
///         TypedBuffer::from_f32s("positions", 3, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
///     );
///
/// let (packed, mut transfers) = result.package();
/// assert_eq!(transfers.len(), 1);
///
/// let rebuilt = packed.reconstruct(&mut transfers, false).unwrap();
/// assert_eq!(rebuilt.buffer("positions").unwrap().as_f32s().unwrap().len(), 6);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    fields: BTreeMap<String, ResultField>,
}

impl StructuredResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert_data(name, value);
        self
    }

    pub fn with_buffer(mut self, name: impl Into<String>, buffer: TypedBuffer) -> Self {
        self.insert_buffer(name, buffer);
        self
    }

    pub fn insert_data(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.fields
            .insert(name.into(), ResultField::Data { value });
    }

    pub fn insert_buffer(&mut self, name: impl Into<String>, buffer: TypedBuffer) {
        self.fields
            .insert(name.into(), ResultField::Buffer { buffer });
    }

    pub fn data(&self, name: &str) -> Option<&serde_json::Value> {
        match self.fields.get(name) {
            Some(ResultField::Data { value }) => Some(value),
            _ => None,
        }
    }

    pub fn buffer(&self, name: &str) -> Option<&TypedBuffer> {
        match self.fields.get(name) {
            Some(ResultField::Buffer { buffer }) => Some(buffer),
            _ => None,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Extract every buffer into a transfer list in stable field order,
    /// leaving a [`TransferDescriptor`] in each buffer's place.
    pub fn package(self) -> (PackedResult, TransferList) {
        let mut transfers = TransferList::new();
        let mut fields = BTreeMap::new();

        for (name, field) in self.fields {
            let packed = match field {
                ResultField::Data { value } => PackedField::Data { value },
                ResultField::Buffer { buffer } => {
                    let slot = transfers.len();
                    let descriptor = buffer.descriptor(slot);
                    transfers.push(buffer.bytes);
                    PackedField::Descriptor { descriptor }
                }
            };
            fields.insert(name, packed);
        }

        (PackedResult { fields }, transfers)
    }
}

/// One field of the buffer-free wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PackedField {
    Data { value: serde_json::Value },
    Descriptor { descriptor: TransferDescriptor },
}

/// The buffer-free wire form of a [`StructuredResult`], paired with the
/// transfer list that carries its buffers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackedResult {
    fields: BTreeMap<String, PackedField>,
}

impl PackedResult {
    /// Number of buffers the metadata expects in the transfer list.
    pub fn descriptor_count(&self) -> usize {
        self.fields
            .values()
            .filter(|field| matches!(field, PackedField::Descriptor { .. }))
            .count()
    }

    /// Rebuild the original structure by substituting each descriptor with
    /// its slot's buffer.
    ///
    /// With `clone_buffers` the transferred bytes are copied and the source
    /// stays usable; otherwise they are moved out, leaving the source-side
    /// buffer empty. Any metadata/transfer-list mismatch fails with
    /// [`OffloadError::PackagingFailure`].
    pub fn reconstruct(
        self,
        transfers: &mut TransferList,
        clone_buffers: bool,
    ) -> Result<StructuredResult> {
        let expected = self.descriptor_count();
        if expected != transfers.len() {
            return Err(OffloadError::PackagingFailure {
                message: format!(
                    "metadata names {expected} buffers but the transfer list holds {}",
                    transfers.len()
                ),
            });
        }

        let mut fields = BTreeMap::new();
        for (name, field) in self.fields {
            let rebuilt = match field {
                PackedField::Data { value } => ResultField::Data { value },
                PackedField::Descriptor { descriptor } => {
                    let slot = descriptor.slot;
                    let source =
                        transfers
                            .get_mut(slot)
                            .ok_or_else(|| OffloadError::PackagingFailure {
                                message: format!(
                                    "descriptor for '{name}' references slot {slot} outside the transfer list"
                                ),
                            })?;
                    let bytes = if clone_buffers {
                        source.clone()
                    } else {
                        mem::take(source)
                    };
                    let expected_bytes = descriptor.len * descriptor.element_type.byte_width();
                    if bytes.len() != expected_bytes {
                        return Err(OffloadError::PackagingFailure {
                            message: format!(
                                "buffer '{}' expects {expected_bytes} bytes, transfer slot {slot} holds {}",
                                descriptor.role,
                                bytes.len()
                            ),
                        });
                    }
                    ResultField::Buffer {
                        buffer: TypedBuffer {
                            role: descriptor.role,
                            element_type: descriptor.element_type,
                            stride: descriptor.stride,
                            bytes,
                        },
                    }
                }
            };
            fields.insert(name, rebuilt);
        }

        Ok(StructuredResult { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> StructuredResult {
        StructuredResult::new()
            .with_data("object_count", serde_json::json!(1))
            .with_buffer(
                "positions",
                TypedBuffer::from_f32s("positions", 3, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            )
            .with_buffer("indices", TypedBuffer::from_u32s("indices", 1, &[0, 1, 2]))
    }

    #[test]
    fn test_package_assigns_slots_in_field_order() {
        let (packed, transfers) = sample_result().package();

        assert_eq!(packed.descriptor_count(), 2);
        assert_eq!(transfers.len(), 2);
        // Field names sort "indices" before "positions".
        assert_eq!(transfers[0].len(), 3 * 4);
        assert_eq!(transfers[1].len(), 6 * 4);
    }

    #[test]
    fn test_reconstruct_clone_preserves_source() {
        let original = sample_result();
        let (packed, mut transfers) = original.clone().package();

        let rebuilt = packed.reconstruct(&mut transfers, true).expect("reconstruct");

        assert_eq!(rebuilt, original);
        // Clone mode leaves the transferred bytes valid.
        assert!(transfers.iter().all(|bytes| !bytes.is_empty()));
    }

    #[test]
    fn test_reconstruct_move_consumes_source() {
        let original = sample_result();
        let (packed, mut transfers) = original.clone().package();

        let rebuilt = packed.reconstruct(&mut transfers, false).expect("reconstruct");

        assert_eq!(rebuilt, original);
        // Move mode empties the source-side buffers.
        assert!(transfers.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_reconstruct_rejects_list_length_mismatch() {
        let (packed, mut transfers) = sample_result().package();
        transfers.pop();

        let result = packed.reconstruct(&mut transfers, false);
        assert!(matches!(
            result,
            Err(OffloadError::PackagingFailure { .. })
        ));
    }

    #[test]
    fn test_reconstruct_rejects_byte_length_mismatch() {
        let (packed, mut transfers) = sample_result().package();
        transfers[0].truncate(4);

        let result = packed.reconstruct(&mut transfers, false);
        assert!(matches!(
            result,
            Err(OffloadError::PackagingFailure { .. })
        ));
    }

    #[test]
    fn test_typed_read_back_checks_element_type() {
        let buffer = TypedBuffer::from_u32s("indices", 1, &[7, 8, 9]);
        assert_eq!(buffer.as_u32s().unwrap(), vec![7, 8, 9]);
        assert!(buffer.as_f32s().is_err());
    }

    #[test]
    fn test_data_fields_pass_through() {
        let (packed, mut transfers) = StructuredResult::new()
            .with_data("status", serde_json::json!("parsed"))
            .package();

        assert!(transfers.is_empty());
        let rebuilt = packed.reconstruct(&mut transfers, false).unwrap();
        assert_eq!(rebuilt.data("status").unwrap(), "parsed");
        assert!(rebuilt.buffer("status").is_none());
    }
}
