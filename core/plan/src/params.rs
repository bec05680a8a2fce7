use otter_primitives::Value;
use std::collections::BTreeMap;

/// Positional parameter id: `$1` is `ParameterId(1)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ParameterId(pub u16);

/// Bound values for the positional parameters of one plan.
///
/// Binding is rebindable: the same finalized plan can be executed again with
/// fresh values, which is how prepared INSERTs reuse their node identity.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParameterBinding {
    values: BTreeMap<u16, Value>,
}

impl ParameterBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, id: ParameterId, value: Value) {
        self.values.insert(id.0, value);
    }

    pub fn get(&self, id: ParameterId) -> Option<&Value> {
        self.values.get(&id.0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when every id in `referenced` has a value.
    pub fn all_bound(&self, referenced: &std::collections::BTreeSet<u16>) -> bool {
        referenced.iter().all(|id| self.values.contains_key(id))
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_rebind() {
        let mut params = ParameterBinding::new();
        params.bind(ParameterId(1), Value::Int64(10));
        assert_eq!(params.get(ParameterId(1)), Some(&Value::Int64(10)));

        params.bind(ParameterId(1), Value::Int64(20));
        assert_eq!(params.get(ParameterId(1)), Some(&Value::Int64(20)));
    }

    #[test]
    fn all_bound_tracks_referenced_set() {
        let mut params = ParameterBinding::new();
        let referenced: std::collections::BTreeSet<u16> = [1, 2].into();
        assert!(!params.all_bound(&referenced));
        params.bind(ParameterId(1), Value::Int64(1));
        assert!(!params.all_bound(&referenced));
        params.bind(ParameterId(2), Value::String("x".into()));
        assert!(params.all_bound(&referenced));
    }
}
