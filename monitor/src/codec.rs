//! Self-describing record/field wire format carried through shared memory (spec
//! §4.3). No external schema: every record names its own relation id and every field
//! names its own id, type tag, and length, so the decoder can skip fields it doesn't
//! recognize and records concatenate without separators.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! record    := relation_id:u16 field* FIELD_END:u16
//! field     := field_id:u16 type_tag:u8 length:u16 payload:u8[length]
//! ```
//!
//! `relation_id` is encoded as `u16` rather than the `u32` spec §3 also allows for,
//! matching the 9-entry relation catalog in [`crate::model::RelationId`].

use crate::error::MonitorError;

/// Sentinel `field_id` marking the end of a record's field list.
const FIELD_END: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Integer = 1,
    Timestamp = 2,
    String = 3,
    GlobalId = 4,
}

impl TryFrom<u8> for TypeTag {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            1 => TypeTag::Integer,
            2 => TypeTag::Timestamp,
            3 => TypeTag::String,
            4 => TypeTag::GlobalId,
            other => return Err(other),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DumpField {
    pub field_id: u16,
    pub type_tag: TypeTag,
    pub payload: Vec<u8>,
}

impl DumpField {
    pub fn as_i64(&self) -> Option<i64> {
        if self.payload.len() != 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload);
        Some(i64::from_le_bytes(buf))
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DumpRecord {
    pub relation_id: u16,
    pub fields: Vec<DumpField>,
}

impl DumpRecord {
    pub fn field(&self, field_id: u16) -> Option<&DumpField> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }
}

/// Appends records to a growable byte buffer. One `Writer` corresponds to one
/// process's contribution for one publish round (spec §4.5 "Collector").
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer::default()
    }

    /// Pre-sizes the backing buffer; a convenience so Collector doesn't need to
    /// reallocate on every record while walking a large attachment list.
    pub fn reserve_hint(&mut self, bytes: usize) {
        self.buf.reserve(bytes);
    }

    pub fn begin_record(&mut self, relation_id: u16) -> RecordWriter<'_> {
        self.buf.extend_from_slice(&relation_id.to_le_bytes());
        RecordWriter { buf: &mut self.buf }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Scoped writer for one record's fields; `end()` (or `Drop`) writes the end marker.
pub struct RecordWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl RecordWriter<'_> {
    fn field_raw(&mut self, field_id: u16, type_tag: TypeTag, payload: &[u8]) {
        self.buf.extend_from_slice(&field_id.to_le_bytes());
        self.buf.push(type_tag as u8);
        let len: u16 = payload
            .len()
            .try_into()
            .expect("field payload must fit in a u16 length");
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn integer(&mut self, field_id: u16, value: i64) -> &mut Self {
        self.field_raw(field_id, TypeTag::Integer, &value.to_le_bytes());
        self
    }

    pub fn timestamp(&mut self, field_id: u16, value: i64) -> &mut Self {
        self.field_raw(field_id, TypeTag::Timestamp, &value.to_le_bytes());
        self
    }

    pub fn string(&mut self, field_id: u16, value: &str) -> &mut Self {
        self.field_raw(field_id, TypeTag::String, value.as_bytes());
        self
    }

    pub fn global_id(&mut self, field_id: u16, value: crate::ids::GlobalId) -> &mut Self {
        self.field_raw(field_id, TypeTag::GlobalId, &value.0.to_le_bytes());
        self
    }

    pub fn end(self) {
        // Drop does the actual write; this method exists so call sites can end a
        // record explicitly and readably.
    }
}

impl Drop for RecordWriter<'_> {
    fn drop(&mut self) {
        self.buf.extend_from_slice(&FIELD_END.to_le_bytes());
    }
}

/// Lazily decodes a concatenated byte stream of [`DumpRecord`]s (spec §4.3).
///
/// `next_record`/`next_field` mirror the two lazy iterators the design calls for,
/// expressed the idiomatic-Rust way (`Result<Option<T>>`) rather than as a C-style
/// `bool` return with an out-parameter.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    current_relation_id: Option<u16>,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder {
            buf,
            pos: 0,
            current_relation_id: None,
        }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// True if every remaining byte is zero: alignment padding left by the store,
    /// never a real record (a real `relation_id` of `0` is reserved/unused).
    fn remaining_is_padding(&self) -> bool {
        self.remaining().iter().all(|&b| b == 0)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MonitorError> {
        if self.pos + n > self.buf.len() {
            return Err(MonitorError::DecodeError(format!(
                "truncated record: wanted {n} bytes, had {}",
                self.buf.len() - self.pos
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn take_u16(&mut self) -> Result<u16, MonitorError> {
        let s = self.take(2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    /// Advances to the next record's header, discarding any fields the caller didn't
    /// consume from the previous one via `next_field`. Returns `Ok(None)` once the
    /// buffer is exhausted or only trailing alignment padding remains.
    pub fn next_record(&mut self) -> Result<Option<u16>, MonitorError> {
        // Skip any fields left over from a record the caller didn't fully drain.
        while self.current_relation_id.is_some() {
            if self.next_field()?.is_none() {
                break;
            }
        }

        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        if self.remaining().len() < 2 || self.remaining_is_padding() {
            return Ok(None);
        }

        let relation_id = self.take_u16()?;
        self.current_relation_id = Some(relation_id);
        Ok(Some(relation_id))
    }

    /// Returns the next field of the record most recently started by
    /// [`Decoder::next_record`], or `Ok(None)` at the record's end marker.
    pub fn next_field(&mut self) -> Result<Option<DumpField>, MonitorError> {
        if self.current_relation_id.is_none() {
            return Ok(None);
        }

        let field_id = self.take_u16()?;
        if field_id == FIELD_END {
            self.current_relation_id = None;
            return Ok(None);
        }

        let type_tag_raw = self.take(1)?[0];
        let type_tag = TypeTag::try_from(type_tag_raw)
            .map_err(|t| MonitorError::DecodeError(format!("unknown type tag {t}")))?;
        let length = self.take_u16()? as usize;
        let payload = self.take(length)?.to_vec();

        Ok(Some(DumpField {
            field_id,
            type_tag,
            payload,
        }))
    }

    /// Decodes every remaining record eagerly. Convenient for tests and for small
    /// dumps; `SnapshotAssembler` uses the lazy form directly so it can filter
    /// records without materializing ones it will reject.
    pub fn decode_all(mut self) -> Result<Vec<DumpRecord>, MonitorError> {
        let mut out = Vec::new();
        while let Some(relation_id) = self.next_record()? {
            let mut fields = Vec::new();
            while let Some(field) = self.next_field()? {
                fields.push(field);
            }
            out.push(DumpRecord { relation_id, fields });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::GlobalId;
    use utils::id::ProcessId;

    fn sample_bytes() -> Vec<u8> {
        let mut w = Writer::new();
        {
            let mut r = w.begin_record(1);
            r.string(1, "db1");
            r.integer(2, 0);
        }
        {
            let mut r = w.begin_record(2);
            r.string(10, "alice");
            r.global_id(11, GlobalId::new(ProcessId(1000), 1));
        }
        w.finish()
    }

    #[test]
    fn round_trip_decodes_every_record_and_field() {
        let bytes = sample_bytes();
        let records = Decoder::new(&bytes).decode_all().unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].relation_id, 1);
        assert_eq!(records[0].field(1).unwrap().as_str(), Some("db1"));
        assert_eq!(records[0].field(2).unwrap().as_i64(), Some(0));

        assert_eq!(records[1].relation_id, 2);
        assert_eq!(records[1].field(10).unwrap().as_str(), Some("alice"));
        assert_eq!(
            records[1].field(11).unwrap().as_i64(),
            Some(GlobalId::new(ProcessId(1000), 1).0)
        );
    }

    #[test]
    fn tolerates_trailing_zero_padding() {
        let mut bytes = sample_bytes();
        bytes.extend_from_slice(&[0u8; 6]);
        let records = Decoder::new(&bytes).decode_all().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn truncated_record_is_a_loud_decode_error() {
        let mut bytes = sample_bytes();
        bytes.truncate(bytes.len() - 1);
        // last byte of the final record's string payload is missing, but since we
        // still have a full header for record 2, force truncation inside its fields
        // by cutting mid-payload instead of at the very end marker.
        let mut w = Writer::new();
        {
            let mut r = w.begin_record(3);
            r.string(1, "truncate-me");
        }
        let mut partial = w.finish();
        partial.truncate(partial.len() - 3);
        let err = Decoder::new(&partial).decode_all().unwrap_err();
        assert!(matches!(err, MonitorError::DecodeError(_)));
    }

    #[test]
    fn lazy_iteration_can_skip_unconsumed_fields() {
        let bytes = sample_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.next_record().unwrap(), Some(1));
        // Don't call next_field at all for record 1; next_record should skip past it.
        assert_eq!(dec.next_record().unwrap(), Some(2));
        let f = dec.next_field().unwrap().unwrap();
        assert_eq!(f.field_id, 10);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug)]
    enum Field {
        Integer(u16, i64),
        Timestamp(u16, i64),
        Str(u16, String),
    }

    fn arb_field() -> impl Strategy<Value = Field> {
        prop_oneof![
            (any::<u16>(), any::<i64>()).prop_map(|(id, v)| Field::Integer(id, v)),
            (any::<u16>(), any::<i64>()).prop_map(|(id, v)| Field::Timestamp(id, v)),
            (any::<u16>(), "[a-zA-Z0-9 ]{0,32}").prop_map(|(id, s)| Field::Str(id, s)),
        ]
    }

    fn arb_record() -> impl Strategy<Value = (u16, Vec<Field>)> {
        (any::<u16>(), proptest::collection::vec(arb_field(), 0..8))
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn decode_of_encode_reconstructs_every_record_and_field(
            records in proptest::collection::vec(arb_record(), 0..8)
        ) {
            let mut writer = Writer::new();
            for (relation_id, fields) in &records {
                let mut r = writer.begin_record(*relation_id);
                for field in fields {
                    match field {
                        Field::Integer(id, v) => { r.integer(*id, *v); }
                        Field::Timestamp(id, v) => { r.timestamp(*id, *v); }
                        Field::Str(id, s) => { r.string(*id, s); }
                    }
                }
            }
            let bytes = writer.finish();

            let decoded = Decoder::new(&bytes).decode_all().unwrap();
            prop_assert_eq!(decoded.len(), records.len());
            for ((relation_id, fields), record) in records.iter().zip(decoded.iter()) {
                prop_assert_eq!(record.relation_id, *relation_id);
                prop_assert_eq!(record.fields.len(), fields.len());
                for (expected, actual) in fields.iter().zip(record.fields.iter()) {
                    match expected {
                        Field::Integer(id, v) => {
                            prop_assert_eq!(actual.field_id, *id);
                            prop_assert_eq!(actual.as_i64(), Some(*v));
                        }
                        Field::Timestamp(id, v) => {
                            prop_assert_eq!(actual.field_id, *id);
                            prop_assert_eq!(actual.as_i64(), Some(*v));
                        }
                        Field::Str(id, s) => {
                            prop_assert_eq!(actual.field_id, *id);
                            prop_assert_eq!(actual.as_str(), Some(s.as_str()));
                        }
                    }
                }
            }
        }
    }
}
