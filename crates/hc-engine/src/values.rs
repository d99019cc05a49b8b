//! Owned variable buffers exchanged with the engine.

use serde::{Deserialize, Serialize};

/// Largest element count accepted for a single variable.
pub const MAX_VAR_LEN: usize = 1 << 21;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Double,
    Int,
}

impl VarType {
    pub fn code(self) -> i32 {
        match self {
            VarType::Double => 0,
            VarType::Int => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(VarType::Double),
            1 => Some(VarType::Int),
            _ => None,
        }
    }
}

/// A complete variable value. Reads and writes are all-or-nothing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum VarValues {
    Double(Vec<f64>),
    Int(Vec<i32>),
}

impl VarValues {
    pub fn var_type(&self) -> VarType {
        match self {
            VarValues::Double(_) => VarType::Double,
            VarValues::Int(_) => VarType::Int,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VarValues::Double(v) => v.len(),
            VarValues::Int(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values widened to `f64`.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            VarValues::Double(v) => v.clone(),
            VarValues::Int(v) => v.iter().map(|&i| f64::from(i)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes() {
        assert_eq!(VarType::from_code(VarType::Double.code()), Some(VarType::Double));
        assert_eq!(VarType::from_code(VarType::Int.code()), Some(VarType::Int));
        assert_eq!(VarType::from_code(7), None);
    }

    #[test]
    fn json_shape_is_tagged() {
        let json = serde_json::to_string(&VarValues::Int(vec![1, 2])).unwrap();
        assert_eq!(json, r#"{"type":"int","values":[1,2]}"#);
    }

    #[test]
    fn widening() {
        let values = VarValues::Int(vec![3, -1]);
        assert_eq!(values.to_f64(), vec![3.0, -1.0]);
        assert_eq!(values.len(), 2);
        assert_eq!(values.var_type(), VarType::Int);
    }
}
