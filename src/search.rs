//! Search predicates: validation and wire encoding.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ReturnCode;

/// A validated set of constraints over one space's dimensions.
///
/// Each dimension may carry at most one constraint: an equality on its value,
/// or a `[low, high)` range over its `u64` interpretation. Dimension 0 (the
/// key) accepts range constraints but never equality; point lookups on the
/// key are what [`get`](crate::Client::get) is for.
#[derive(Debug, Clone, Default)]
pub struct SearchPredicate {
    equality: Vec<Option<Bytes>>,
    ranges: Vec<Option<(u64, u64)>>,
}

impl SearchPredicate {
    /// Build a predicate from name-keyed constraint maps.
    ///
    /// Fails with `BadSearch` when a name resolves to no dimension, appears
    /// in both maps, or requests equality on the key dimension. Empty maps
    /// constrain nothing.
    pub fn build(
        dimensions: &[String],
        equality: &HashMap<String, Bytes>,
        range: &HashMap<String, (u64, u64)>,
    ) -> Result<Self, ReturnCode> {
        let mut pred = Self {
            equality: vec![None; dimensions.len()],
            ranges: vec![None; dimensions.len()],
        };

        for (name, value) in equality {
            match dimensions.iter().position(|dim| dim == name) {
                Some(0) | None => return Err(ReturnCode::BadSearch),
                Some(idx) => pred.equality[idx] = Some(value.clone()),
            }
        }

        for (name, &(low, high)) in range {
            if equality.contains_key(name) {
                return Err(ReturnCode::BadSearch);
            }
            match dimensions.iter().position(|dim| dim == name) {
                None => return Err(ReturnCode::BadSearch),
                Some(idx) => pred.ranges[idx] = Some((low, high)),
            }
        }

        Ok(pred)
    }

    /// Number of dimensions the predicate spans.
    pub fn arity(&self) -> usize {
        self.equality.len()
    }

    /// Whether the predicate constrains nothing.
    pub fn is_unconstrained(&self) -> bool {
        self.equality.iter().all(Option::is_none) && self.ranges.iter().all(Option::is_none)
    }

    /// Equality constraint at `idx`, if any.
    pub fn equality_at(&self, idx: usize) -> Option<&Bytes> {
        self.equality.get(idx).and_then(Option::as_ref)
    }

    /// Range constraint at `idx`, if any.
    pub fn range_at(&self, idx: usize) -> Option<(u64, u64)> {
        self.ranges.get(idx).and_then(|r| *r)
    }

    /// Append the predicate to a request payload.
    ///
    /// Layout: arity as u16, then per dimension a flags byte (bit 0 =
    /// equality present, bit 1 = range present) followed by the constraint
    /// bodies it announces.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.arity() as u16);
        for idx in 0..self.arity() {
            let eq = self.equality[idx].as_ref();
            let range = self.ranges[idx];

            let mut flags = 0u8;
            if eq.is_some() {
                flags |= 0x01;
            }
            if range.is_some() {
                flags |= 0x02;
            }
            buf.put_u8(flags);

            if let Some(value) = eq {
                crate::wire::put_buffer(buf, value);
            }
            if let Some((low, high)) = range {
                buf.put_u64(low);
                buf.put_u64(high);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Vec<String> {
        vec!["id".into(), "name".into(), "age".into()]
    }

    fn eq(pairs: &[(&str, &[u8])]) -> HashMap<String, Bytes> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v)))
            .collect()
    }

    fn ranges(pairs: &[(&str, (u64, u64))]) -> HashMap<String, (u64, u64)> {
        pairs.iter().map(|(k, r)| (k.to_string(), *r)).collect()
    }

    #[test]
    fn build_records_constraints_by_index() {
        let pred = SearchPredicate::build(
            &dims(),
            &eq(&[("name", b"alice")]),
            &ranges(&[("age", (18, 65))]),
        )
        .unwrap();

        assert_eq!(pred.arity(), 3);
        assert!(!pred.is_unconstrained());
        assert_eq!(pred.equality_at(1).unwrap(), &Bytes::from_static(b"alice"));
        assert_eq!(pred.range_at(2), Some((18, 65)));
        assert!(pred.equality_at(0).is_none() && pred.range_at(0).is_none());
    }

    #[test]
    fn equality_on_key_dimension_is_rejected() {
        let err = SearchPredicate::build(&dims(), &eq(&[("id", b"42")]), &HashMap::new());
        assert_eq!(err.unwrap_err(), ReturnCode::BadSearch);
    }

    #[test]
    fn range_on_key_dimension_is_allowed() {
        let pred =
            SearchPredicate::build(&dims(), &HashMap::new(), &ranges(&[("id", (0, 100))])).unwrap();
        assert_eq!(pred.range_at(0), Some((0, 100)));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = SearchPredicate::build(&dims(), &eq(&[("nope", b"x")]), &HashMap::new());
        assert_eq!(err.unwrap_err(), ReturnCode::BadSearch);

        let err = SearchPredicate::build(&dims(), &HashMap::new(), &ranges(&[("nope", (0, 1))]));
        assert_eq!(err.unwrap_err(), ReturnCode::BadSearch);
    }

    #[test]
    fn name_in_both_maps_is_rejected() {
        let err = SearchPredicate::build(
            &dims(),
            &eq(&[("name", b"alice")]),
            &ranges(&[("name", (0, 1))]),
        );
        assert_eq!(err.unwrap_err(), ReturnCode::BadSearch);
    }

    #[test]
    fn empty_maps_constrain_nothing() {
        let pred = SearchPredicate::build(&dims(), &HashMap::new(), &HashMap::new()).unwrap();
        assert!(pred.is_unconstrained());
    }

    #[test]
    fn encode_layout() {
        let pred = SearchPredicate::build(
            &dims(),
            &eq(&[("name", b"alice")]),
            &ranges(&[("age", (18, 65))]),
        )
        .unwrap();

        let mut buf = BytesMut::new();
        pred.encode(&mut buf);

        // arity + unconstrained dim 0 + (flags + len + "alice") + (flags + two u64s)
        assert_eq!(buf.len(), 2 + 1 + (1 + 4 + 5) + (1 + 16));
        assert_eq!(&buf[..2], &[0, 3]);
        assert_eq!(buf[2], 0x00);
        assert_eq!(buf[3], 0x01);
    }
}
