//! Slice/length operations on array values.
//!
//! The wire negotiates an element descriptor; these helpers apply the
//! four array sub-operations to whatever array variant the record holds.
//! Writes return the updated field for the caller to store back.

use pva_proto::{
    PvValue,
    payloads::operation::{ArrayRequest, ArrayResponseBody},
};

/// Apply an array request to the current field value. Returns the
/// response body plus an optional replacement field (for writes).
pub(crate) fn apply(
    field: PvValue,
    request: &ArrayRequest,
) -> Result<(ArrayResponseBody, Option<PvValue>), String> {
    match request {
        ArrayRequest::GetLength => {
            let length = field.array_len().ok_or("field is not an array")? as u64;
            Ok((ArrayResponseBody::Length { length, capacity: length }, None))
        }
        ArrayRequest::GetSlice { offset, count } => {
            let slice = slice_array(&field, *offset as usize, *count)?;
            Ok((ArrayResponseBody::Slice(slice), None))
        }
        ArrayRequest::PutSlice { offset, values } => {
            let updated = splice_array(field, *offset as usize, values)?;
            Ok((ArrayResponseBody::Ack, Some(updated)))
        }
        ArrayRequest::SetLength { length, capacity } => {
            // capacity is advisory for an in-memory Vec
            let _ = capacity;
            let updated = if *length < 0 { field } else { resize_array(field, *length as usize)? };
            Ok((ArrayResponseBody::Ack, Some(updated)))
        }
    }
}

macro_rules! per_array {
    ($value:expr, $vec:ident => $body:expr) => {
        match $value {
            PvValue::BoolArray($vec) => PvValue::BoolArray($body),
            PvValue::I8Array($vec) => PvValue::I8Array($body),
            PvValue::I16Array($vec) => PvValue::I16Array($body),
            PvValue::I32Array($vec) => PvValue::I32Array($body),
            PvValue::I64Array($vec) => PvValue::I64Array($body),
            PvValue::U8Array($vec) => PvValue::U8Array($body),
            PvValue::U16Array($vec) => PvValue::U16Array($body),
            PvValue::U32Array($vec) => PvValue::U32Array($body),
            PvValue::U64Array($vec) => PvValue::U64Array($body),
            PvValue::F32Array($vec) => PvValue::F32Array($body),
            PvValue::F64Array($vec) => PvValue::F64Array($body),
            PvValue::StringArray($vec) => PvValue::StringArray($body),
            _ => return Err("field is not a scalar array".into()),
        }
    };
}

fn slice_array(field: &PvValue, offset: usize, count: i64) -> Result<PvValue, String> {
    fn take<T: Clone>(v: &[T], offset: usize, count: i64) -> Vec<T> {
        let start = offset.min(v.len());
        let end = if count < 0 {
            v.len()
        } else {
            start.saturating_add(count as usize).min(v.len())
        };
        v[start..end].to_vec()
    }
    Ok(per_array!(field, v => take(v, offset, count)))
}

fn splice_array(field: PvValue, offset: usize, values: &PvValue) -> Result<PvValue, String> {
    fn put<T: Clone + Default>(mut dst: Vec<T>, offset: usize, src: &[T]) -> Vec<T> {
        let needed = offset + src.len();
        if dst.len() < needed {
            dst.resize(needed, T::default());
        }
        dst[offset..needed].clone_from_slice(src);
        dst
    }
    macro_rules! splice {
        ($($variant:ident),+) => {
            match (field, values) {
                $((PvValue::$variant(dst), PvValue::$variant(src)) => {
                    Ok(PvValue::$variant(put(dst, offset, src)))
                })+
                _ => Err("element type mismatch".into()),
            }
        };
    }
    splice!(
        BoolArray, I8Array, I16Array, I32Array, I64Array, U8Array, U16Array, U32Array,
        U64Array, F32Array, F64Array, StringArray
    )
}

fn resize_array(field: PvValue, length: usize) -> Result<PvValue, String> {
    fn sized<T: Clone + Default>(mut v: Vec<T>, length: usize) -> Vec<T> {
        v.resize(length, T::default());
        v
    }
    Ok(per_array!(field, v => sized(v, length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_slice_clamps_to_bounds() {
        let field = PvValue::F64Array(vec![1.0, 2.0, 3.0, 4.0]);
        let (body, _) =
            apply(field.clone(), &ArrayRequest::GetSlice { offset: 2, count: 10 }).unwrap();
        assert_eq!(body, ArrayResponseBody::Slice(PvValue::F64Array(vec![3.0, 4.0])));

        let (body, _) = apply(field, &ArrayRequest::GetSlice { offset: 1, count: -1 }).unwrap();
        assert_eq!(body, ArrayResponseBody::Slice(PvValue::F64Array(vec![2.0, 3.0, 4.0])));
    }

    #[test]
    fn put_slice_grows_as_needed() {
        let field = PvValue::I32Array(vec![1, 2]);
        let (_, updated) = apply(
            field,
            &ArrayRequest::PutSlice { offset: 3, values: PvValue::I32Array(vec![9, 9]) },
        )
        .unwrap();
        assert_eq!(updated, Some(PvValue::I32Array(vec![1, 2, 0, 9, 9])));
    }

    #[test]
    fn set_length_minus_one_keeps_length() {
        let field = PvValue::I32Array(vec![1, 2, 3]);
        let (_, updated) =
            apply(field.clone(), &ArrayRequest::SetLength { length: -1, capacity: -1 }).unwrap();
        assert_eq!(updated, Some(field));

        let field = PvValue::I32Array(vec![1, 2, 3]);
        let (_, updated) =
            apply(field, &ArrayRequest::SetLength { length: 5, capacity: -1 }).unwrap();
        assert_eq!(updated, Some(PvValue::I32Array(vec![1, 2, 3, 0, 0])));
    }

    #[test]
    fn element_type_mismatch_is_rejected() {
        let field = PvValue::I32Array(vec![1]);
        let result = apply(
            field,
            &ArrayRequest::PutSlice { offset: 0, values: PvValue::F64Array(vec![1.0]) },
        );
        assert!(result.is_err());
    }

    #[test]
    fn non_array_field_is_rejected() {
        let result = apply(PvValue::I32(1), &ArrayRequest::GetLength);
        assert!(result.is_err());
    }
}
