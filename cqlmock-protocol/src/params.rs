//! Query, execute and prepare parameters.
//!
//! The layout of these parameters changed with almost every protocol
//! version, so both directions dispatch on the version:
//!
//! ```text
//! v1         [values]? <consistency>              (values for EXECUTE only)
//! v2         <consistency><flags:1>[values][page_size][paging_state][serial]
//! v3, v4     <consistency><flags:1>[values|named][page_size][paging_state][serial][timestamp]
//! v5         <consistency><flags:4>[values|named][page_size][paging_state][serial][timestamp][keyspace]
//! ```
//!
//! Optional fields are present only when their flag bit is set.

use crate::buffer::Buffer;
use crate::codec::{self, Decoded, Value};
use crate::error::ProtocolError;

/// Flags controlling which optional query parameters follow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueryFlags(i32);

impl QueryFlags {
    pub const VALUES: i32 = 0x01;
    pub const SKIP_METADATA: i32 = 0x02;
    pub const PAGE_SIZE: i32 = 0x04;
    pub const PAGING_STATE: i32 = 0x08;
    pub const SERIAL_CONSISTENCY: i32 = 0x10;
    /// v3 and later.
    pub const DEFAULT_TIMESTAMP: i32 = 0x20;
    /// v3 and later.
    pub const NAMES_FOR_VALUES: i32 = 0x40;
    /// v5 and later.
    pub const KEYSPACE: i32 = 0x80;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn contains(&self, flag: i32) -> bool {
        self.0 & flag != 0
    }

    pub fn with(mut self, flag: i32) -> Self {
        self.0 |= flag;
        self
    }

    pub fn without(mut self, flag: i32) -> Self {
        self.0 &= !flag;
        self
    }

    /// Bits with a defined meaning for `version`.
    pub fn valid_mask(version: u8) -> i32 {
        match version {
            1 => 0,
            2 => 0x1f,
            3 | 4 => 0x7f,
            _ => 0xff,
        }
    }
}

/// Parameters following the query string of QUERY or the id of EXECUTE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameters {
    pub consistency: u16,
    pub flags: QueryFlags,
    pub values: Vec<Value>,
    /// Only populated when values are sent with names.
    pub names: Vec<String>,
    pub result_page_size: i32,
    pub paging_state: Option<Buffer>,
    pub serial_consistency: u16,
    pub timestamp: i64,
    pub keyspace: String,
}

/// Flag for [`PrepareParameters::flags`]: a keyspace follows.
pub const PREPARE_FLAG_KEYSPACE: i32 = 0x01;

/// Parameters following the query string of PREPARE (v5 only).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareParameters {
    pub flags: i32,
    pub keyspace: String,
}

fn check_version(version: u8) -> Result<(), ProtocolError> {
    if (crate::LOWEST_SUPPORTED_VERSION..=crate::HIGHEST_SUPPORTED_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedVersion(version))
    }
}

fn uses_names(version: u8, params: &QueryParameters) -> bool {
    version >= 3
        && params.flags.contains(QueryFlags::VALUES)
        && params.flags.contains(QueryFlags::NAMES_FOR_VALUES)
}

/// Decodes query parameters for `version`.
///
/// `is_execute` only matters for v1, where EXECUTE carries values ahead of
/// the consistency and QUERY carries none.
pub fn decode_query_params(
    version: u8,
    input: &[u8],
    is_execute: bool,
) -> Decoded<'_, QueryParameters> {
    check_version(version)?;
    let mut params = QueryParameters::default();

    if version == 1 {
        let mut rest = input;
        if is_execute {
            let (values, next) = codec::decode_values(rest)?;
            params.values = values;
            rest = next;
        }
        let (consistency, rest) = codec::decode_uint16(rest)?;
        params.consistency = consistency;
        return Ok((params, rest));
    }

    let (consistency, rest) = codec::decode_uint16(input)?;
    params.consistency = consistency;

    let (flags, mut rest) = if version >= 5 {
        codec::decode_int32(rest)?
    } else {
        let (flags, rest) = codec::decode_byte(rest)?;
        (i32::from(flags), rest)
    };
    params.flags = QueryFlags::from_bits(flags);

    if params.flags.contains(QueryFlags::VALUES) {
        if uses_names(version, &params) {
            let ((names, values), next) = codec::decode_named_values(rest)?;
            params.names = names;
            params.values = values;
            rest = next;
        } else {
            let (values, next) = codec::decode_values(rest)?;
            params.values = values;
            rest = next;
        }
    }

    if params.flags.contains(QueryFlags::PAGE_SIZE) {
        let (page_size, next) = codec::decode_int32(rest)?;
        params.result_page_size = page_size;
        rest = next;
    }

    if params.flags.contains(QueryFlags::PAGING_STATE) {
        let (paging_state, next) = codec::decode_bytes(rest)?;
        params.paging_state = paging_state;
        rest = next;
    }

    if params.flags.contains(QueryFlags::SERIAL_CONSISTENCY) {
        let (serial, next) = codec::decode_uint16(rest)?;
        params.serial_consistency = serial;
        rest = next;
    }

    if version >= 3 && params.flags.contains(QueryFlags::DEFAULT_TIMESTAMP) {
        let (timestamp, next) = codec::decode_int64(rest)?;
        params.timestamp = timestamp;
        rest = next;
    }

    if version >= 5 && params.flags.contains(QueryFlags::KEYSPACE) {
        let (keyspace, next) = codec::decode_string(rest)?;
        params.keyspace = keyspace;
        rest = next;
    }

    Ok((params, rest))
}

/// Decodes prepare parameters. Versions before 5 have none and consume nothing.
pub fn decode_prepare_params(version: u8, input: &[u8]) -> Decoded<'_, PrepareParameters> {
    check_version(version)?;
    let mut params = PrepareParameters::default();
    if version < 5 {
        return Ok((params, input));
    }

    let (flags, mut rest) = codec::decode_int32(input)?;
    params.flags = flags;
    if flags & PREPARE_FLAG_KEYSPACE != 0 {
        let (keyspace, next) = codec::decode_string(rest)?;
        params.keyspace = keyspace;
        rest = next;
    }
    Ok((params, rest))
}

/// Exact number of bytes [`encode_query_params`] will write.
pub fn encoded_query_params_size(
    version: u8,
    params: &QueryParameters,
    is_execute: bool,
) -> Result<usize, ProtocolError> {
    check_version(version)?;

    if version == 1 {
        let values = if is_execute {
            codec::sizeof_values(&params.values)
        } else {
            0
        };
        return Ok(values + 2);
    }

    let flags = params.flags;
    let mut size = 2 + if version >= 5 { 4 } else { 1 };

    if flags.contains(QueryFlags::VALUES) {
        if uses_names(version, params) {
            if params.names.len() != params.values.len() {
                return Err(ProtocolError::MismatchedNames {
                    names: params.names.len(),
                    values: params.values.len(),
                });
            }
            size += 2;
            for (name, value) in params.names.iter().zip(&params.values) {
                size += codec::sizeof_string(name) + codec::sizeof_value(value);
            }
        } else {
            size += codec::sizeof_values(&params.values);
        }
    }
    if flags.contains(QueryFlags::PAGE_SIZE) {
        size += 4;
    }
    if flags.contains(QueryFlags::PAGING_STATE) {
        size += codec::sizeof_bytes(params.paging_state.as_deref());
    }
    if flags.contains(QueryFlags::SERIAL_CONSISTENCY) {
        size += 2;
    }
    if version >= 3 && flags.contains(QueryFlags::DEFAULT_TIMESTAMP) {
        size += 8;
    }
    if version >= 5 && flags.contains(QueryFlags::KEYSPACE) {
        size += codec::sizeof_string(&params.keyspace);
    }
    Ok(size)
}

fn encode_values(buffer: &mut Buffer, offset: usize, values: &[Value]) -> usize {
    let mut pos = buffer.encode_uint16(offset, values.len() as u16);
    for value in values {
        pos = buffer.encode_value(pos, value);
    }
    pos
}

/// Encodes query parameters at `offset` and returns the offset past them.
///
/// The buffer must have room for [`encoded_query_params_size`] bytes.
pub fn encode_query_params(
    version: u8,
    params: &QueryParameters,
    is_execute: bool,
    buffer: &mut Buffer,
    offset: usize,
) -> Result<usize, ProtocolError> {
    // Validates the version and the names/values pairing up front.
    encoded_query_params_size(version, params, is_execute)?;

    if version == 1 {
        let mut pos = offset;
        if is_execute {
            pos = encode_values(buffer, pos, &params.values);
        }
        return Ok(buffer.encode_uint16(pos, params.consistency));
    }

    let flags = params.flags;
    let mut pos = buffer.encode_uint16(offset, params.consistency);
    pos = if version >= 5 {
        buffer.encode_int32(pos, flags.bits())
    } else {
        buffer.encode_byte(pos, flags.bits() as u8)
    };

    if flags.contains(QueryFlags::VALUES) {
        if uses_names(version, params) {
            pos = buffer.encode_uint16(pos, params.values.len() as u16);
            for (name, value) in params.names.iter().zip(&params.values) {
                pos = buffer.encode_string(pos, name);
                pos = buffer.encode_value(pos, value);
            }
        } else {
            pos = encode_values(buffer, pos, &params.values);
        }
    }
    if flags.contains(QueryFlags::PAGE_SIZE) {
        pos = buffer.encode_int32(pos, params.result_page_size);
    }
    if flags.contains(QueryFlags::PAGING_STATE) {
        pos = buffer.encode_bytes(pos, params.paging_state.as_deref());
    }
    if flags.contains(QueryFlags::SERIAL_CONSISTENCY) {
        pos = buffer.encode_uint16(pos, params.serial_consistency);
    }
    if version >= 3 && flags.contains(QueryFlags::DEFAULT_TIMESTAMP) {
        pos = buffer.encode_int64(pos, params.timestamp);
    }
    if version >= 5 && flags.contains(QueryFlags::KEYSPACE) {
        pos = buffer.encode_string(pos, &params.keyspace);
    }
    Ok(pos)
}

pub fn encoded_prepare_params_size(
    version: u8,
    params: &PrepareParameters,
) -> Result<usize, ProtocolError> {
    check_version(version)?;
    if version < 5 {
        return Ok(0);
    }
    let mut size = 4;
    if params.flags & PREPARE_FLAG_KEYSPACE != 0 {
        size += codec::sizeof_string(&params.keyspace);
    }
    Ok(size)
}

pub fn encode_prepare_params(
    version: u8,
    params: &PrepareParameters,
    buffer: &mut Buffer,
    offset: usize,
) -> Result<usize, ProtocolError> {
    check_version(version)?;
    if version < 5 {
        return Ok(offset);
    }
    let mut pos = buffer.encode_int32(offset, params.flags);
    if params.flags & PREPARE_FLAG_KEYSPACE != 0 {
        pos = buffer.encode_string(pos, &params.keyspace);
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(version: u8, params: &QueryParameters, is_execute: bool) -> Buffer {
        let size = encoded_query_params_size(version, params, is_execute).unwrap();
        let mut buffer = Buffer::with_size(size);
        let end = encode_query_params(version, params, is_execute, &mut buffer, 0).unwrap();
        assert_eq!(end, size);
        buffer
    }

    #[test]
    fn test_v1_query_is_consistency_only() {
        let (params, rest) = decode_query_params(1, &[0x00, 0x01, 0xaa], false).unwrap();
        assert_eq!(params.consistency, 1);
        assert!(params.values.is_empty());
        assert_eq!(rest, &[0xaa]);
    }

    #[test]
    fn test_v1_execute_reads_values_first() {
        let input = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x07, 0x00, 0x04];
        let (params, rest) = decode_query_params(1, &input, true).unwrap();
        assert_eq!(params.values, vec![Value::bytes(&[7u8][..])]);
        assert_eq!(params.consistency, 4);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_v4_decode_all_fields() {
        let input = [
            0x00, 0x06, // consistency
            0x3d, // values | page size | paging state | serial | timestamp
            0x00, 0x01, 0xff, 0xff, 0xff, 0xff, // one null value
            0x00, 0x00, 0x13, 0x88, // page size 5000
            0x00, 0x00, 0x00, 0x02, 0xab, 0xcd, // paging state
            0x00, 0x09, // serial consistency
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2a, // timestamp
        ];
        let (params, rest) = decode_query_params(4, &input, false).unwrap();
        assert!(rest.is_empty());
        assert_eq!(params.consistency, 6);
        assert_eq!(params.values, vec![Value::Null]);
        assert_eq!(params.result_page_size, 5000);
        assert_eq!(params.paging_state, Some(Buffer::from_slice(&[0xab, 0xcd])));
        assert_eq!(params.serial_consistency, 9);
        assert_eq!(params.timestamp, 42);
        assert!(params.keyspace.is_empty());
    }

    #[test]
    fn test_v2_ignores_timestamp_bit() {
        let (params, rest) = decode_query_params(2, &[0x00, 0x01, 0x20, 0xee], false).unwrap();
        assert_eq!(params.timestamp, 0);
        assert_eq!(rest, &[0xee]);
    }

    #[test]
    fn test_v4_named_values() {
        let input = [
            0x00, 0x01, 0x41, 0x00, 0x01, 0x00, 0x01, b'k', 0x00, 0x00, 0x00, 0x00,
        ];
        let (params, rest) = decode_query_params(4, &input, false).unwrap();
        assert!(rest.is_empty());
        assert_eq!(params.names, vec!["k".to_string()]);
        assert_eq!(params.values, vec![Value::bytes(Buffer::new())]);
    }

    #[test]
    fn test_v5_keyspace_and_wide_flags() {
        let input = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x80, 0x00, 0x02, b'k', b's',
        ];
        let (params, rest) = decode_query_params(5, &input, false).unwrap();
        assert!(rest.is_empty());
        assert_eq!(params.keyspace, "ks");
        assert!(params.flags.contains(QueryFlags::KEYSPACE));
    }

    #[test]
    fn test_truncated_params() {
        let err = decode_query_params(4, &[0x00, 0x01, 0x04, 0x00], false).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_unsupported_version_is_an_error() {
        for version in [0u8, 6, 0x7f] {
            let err = decode_query_params(version, &[0, 1, 0], false).unwrap_err();
            assert!(matches!(err, ProtocolError::UnsupportedVersion(v) if v == version));
            assert!(decode_prepare_params(version, &[]).is_err());
            assert!(encoded_query_params_size(version, &QueryParameters::default(), false).is_err());
        }
    }

    #[test]
    fn test_prepare_params_by_version() {
        let (params, rest) = decode_prepare_params(4, &[0xaa]).unwrap();
        assert_eq!(params, PrepareParameters::default());
        assert_eq!(rest, &[0xaa]);

        let input = [0x00, 0x00, 0x00, 0x01, 0x00, 0x03, b'f', b'o', b'o'];
        let (params, rest) = decode_prepare_params(5, &input).unwrap();
        assert!(rest.is_empty());
        assert_eq!(params.flags, PREPARE_FLAG_KEYSPACE);
        assert_eq!(params.keyspace, "foo");
    }

    #[test]
    fn test_prepare_params_encode() {
        let params = PrepareParameters {
            flags: PREPARE_FLAG_KEYSPACE,
            keyspace: "ks".to_string(),
        };
        let size = encoded_prepare_params_size(5, &params).unwrap();
        let mut buffer = Buffer::with_size(size);
        encode_prepare_params(5, &params, &mut buffer, 0).unwrap();
        let (decoded, rest) = decode_prepare_params(5, &buffer).unwrap();
        assert_eq!(decoded, params);
        assert!(rest.is_empty());

        assert_eq!(encoded_prepare_params_size(3, &params).unwrap(), 0);
    }

    #[test]
    fn test_mismatched_names_rejected() {
        let params = QueryParameters {
            flags: QueryFlags::new()
                .with(QueryFlags::VALUES)
                .with(QueryFlags::NAMES_FOR_VALUES),
            values: vec![Value::Null],
            ..Default::default()
        };
        let err = encoded_query_params_size(4, &params, false).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MismatchedNames {
                names: 0,
                values: 1
            }
        ));
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            Just(Value::Unset),
            proptest::collection::vec(any::<u8>(), 0..40).prop_map(|b| Value::Bytes(b.into())),
        ]
    }

    /// Clears every field the flags (and version) say is absent.
    fn normalize(version: u8, is_execute: bool, mut params: QueryParameters) -> QueryParameters {
        let flags = QueryFlags::from_bits(params.flags.bits() & QueryFlags::valid_mask(version));
        params.flags = flags;
        if version == 1 {
            return QueryParameters {
                consistency: params.consistency,
                values: if is_execute { params.values } else { Vec::new() },
                ..Default::default()
            };
        }
        if !flags.contains(QueryFlags::VALUES) {
            params.values.clear();
        }
        if !uses_names(version, &params) {
            params.names.clear();
        } else {
            params.names.truncate(params.values.len());
            while params.names.len() < params.values.len() {
                params.names.push(format!("n{}", params.names.len()));
            }
        }
        if !flags.contains(QueryFlags::PAGE_SIZE) {
            params.result_page_size = 0;
        }
        if !flags.contains(QueryFlags::PAGING_STATE) {
            params.paging_state = None;
        }
        if !flags.contains(QueryFlags::SERIAL_CONSISTENCY) {
            params.serial_consistency = 0;
        }
        if version < 3 || !flags.contains(QueryFlags::DEFAULT_TIMESTAMP) {
            params.timestamp = 0;
        }
        if version < 5 || !flags.contains(QueryFlags::KEYSPACE) {
            params.keyspace.clear();
        }
        params
    }

    prop_compose! {
        fn arb_params()(
            consistency in any::<u16>(),
            flags in 0i32..0x100,
            values in proptest::collection::vec(value_strategy(), 0..6),
            names in proptest::collection::vec("[a-z]{1,8}", 0..6),
            result_page_size in any::<i32>(),
            paging_state in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..24)),
            serial_consistency in any::<u16>(),
            timestamp in any::<i64>(),
            keyspace in "[a-z_]{0,12}",
        ) -> QueryParameters {
            QueryParameters {
                consistency,
                flags: QueryFlags::from_bits(flags),
                values,
                names,
                result_page_size,
                paging_state: paging_state.map(Buffer::from),
                serial_consistency,
                timestamp,
                keyspace,
            }
        }
    }

    proptest! {
        #[test]
        fn test_query_params_roundtrip(
            version in 1u8..=5,
            is_execute in any::<bool>(),
            params in arb_params(),
            trailer in proptest::collection::vec(any::<u8>(), 0..4),
        ) {
            let params = normalize(version, is_execute, params);
            let encoded = encode(version, &params, is_execute);

            let mut input = encoded.to_vec();
            input.extend_from_slice(&trailer);

            let (decoded, rest) = decode_query_params(version, &input, is_execute).unwrap();
            prop_assert_eq!(decoded, params);
            prop_assert_eq!(rest, &trailer[..]);
        }

        #[test]
        fn test_truncated_params_never_panic(
            version in 1u8..=5,
            params in arb_params(),
            cut in any::<proptest::sample::Index>(),
        ) {
            let params = normalize(version, true, params);
            let encoded = encode(version, &params, true);
            let cut = cut.index(encoded.len());
            let result = decode_query_params(version, &encoded[..cut], true);
            let is_truncated = matches!(result, Err(ProtocolError::Truncated { .. }));
            prop_assert!(is_truncated);
        }
    }
}
