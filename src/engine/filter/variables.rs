//! Keyed storage for optimization variables.
//!
//! Every variable has six degrees of freedom: an SE(3) pose updated
//! left-multiplicatively, or a plain ℝ⁶ vector. Locked variables keep their
//! value and stay out of the normal equations.

use std::collections::BTreeMap;

use nalgebra::Vector6;

use crate::core::se3::Se3;
use crate::error::OdometryError;

/// Handle to a stored variable. Keys are unique for the lifetime of the
/// store and ordered by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarKey(pub u32);

/// A variable's value.
#[derive(Debug, Clone, Copy)]
pub enum VarValue {
    Pose(Se3),
    Vector(Vector6<f64>),
}

impl VarValue {
    /// Local difference `self ⊟ other`: `log(T · T_other⁻¹)` for poses,
    /// plain subtraction for vectors.
    pub fn boxminus(&self, other: &VarValue) -> Result<Vector6<f64>, OdometryError> {
        match (self, other) {
            (VarValue::Pose(a), VarValue::Pose(b)) => Ok(a.compose(&b.inverse()).log()),
            (VarValue::Vector(a), VarValue::Vector(b)) => Ok(a - b),
            _ => Err(OdometryError::InvariantViolation(
                "boxminus between mismatched variable kinds".to_string(),
            )),
        }
    }
}

/// A stored variable with its lock state.
#[derive(Debug, Clone, Copy)]
pub struct Variable {
    pub value: VarValue,
    pub locked: bool,
}

/// Ordered variable container.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: BTreeMap<VarKey, Variable>,
    next_key: u32,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pose(&mut self, value: Se3, locked: bool) -> VarKey {
        self.add(VarValue::Pose(value), locked)
    }

    pub fn add_vector(&mut self, value: Vector6<f64>, locked: bool) -> VarKey {
        self.add(VarValue::Vector(value), locked)
    }

    fn add(&mut self, value: VarValue, locked: bool) -> VarKey {
        let key = VarKey(self.next_key);
        self.next_key += 1;
        self.vars.insert(key, Variable { value, locked });
        key
    }

    pub fn contains(&self, key: VarKey) -> bool {
        self.vars.contains_key(&key)
    }

    pub fn get(&self, key: VarKey) -> Result<&Variable, OdometryError> {
        self.vars.get(&key).ok_or_else(|| {
            OdometryError::InvariantViolation(format!("unknown variable {key:?}"))
        })
    }

    pub fn value(&self, key: VarKey) -> Result<VarValue, OdometryError> {
        Ok(self.get(key)?.value)
    }

    pub fn pose(&self, key: VarKey) -> Result<Se3, OdometryError> {
        match self.get(key)?.value {
            VarValue::Pose(p) => Ok(p),
            VarValue::Vector(_) => Err(OdometryError::InvariantViolation(format!(
                "variable {key:?} is not a pose"
            ))),
        }
    }

    pub fn vector(&self, key: VarKey) -> Result<Vector6<f64>, OdometryError> {
        match self.get(key)?.value {
            VarValue::Vector(v) => Ok(v),
            VarValue::Pose(_) => Err(OdometryError::InvariantViolation(format!(
                "variable {key:?} is not a vector"
            ))),
        }
    }

    pub fn set_pose(&mut self, key: VarKey, value: Se3) -> Result<(), OdometryError> {
        match self.vars.get_mut(&key) {
            Some(var) => {
                var.value = VarValue::Pose(value);
                Ok(())
            }
            None => Err(OdometryError::InvariantViolation(format!(
                "unknown variable {key:?}"
            ))),
        }
    }

    pub fn set_vector(&mut self, key: VarKey, value: Vector6<f64>) -> Result<(), OdometryError> {
        match self.vars.get_mut(&key) {
            Some(var) => {
                var.value = VarValue::Vector(value);
                Ok(())
            }
            None => Err(OdometryError::InvariantViolation(format!(
                "unknown variable {key:?}"
            ))),
        }
    }

    pub fn is_locked(&self, key: VarKey) -> Result<bool, OdometryError> {
        Ok(self.get(key)?.locked)
    }

    pub fn set_locked(&mut self, key: VarKey, locked: bool) -> Result<(), OdometryError> {
        match self.vars.get_mut(&key) {
            Some(var) => {
                var.locked = locked;
                Ok(())
            }
            None => Err(OdometryError::InvariantViolation(format!(
                "unknown variable {key:?}"
            ))),
        }
    }

    /// Apply a 6-dof step: `T ← exp(δ)·T` for poses, `v ← v + δ` for
    /// vectors.
    pub fn apply_step(&mut self, key: VarKey, delta: &Vector6<f64>) -> Result<(), OdometryError> {
        match self.vars.get_mut(&key) {
            Some(var) => {
                match &mut var.value {
                    VarValue::Pose(pose) => *pose = Se3::exp(delta).compose(pose),
                    VarValue::Vector(v) => *v += delta,
                }
                Ok(())
            }
            None => Err(OdometryError::InvariantViolation(format!(
                "unknown variable {key:?}"
            ))),
        }
    }

    pub fn remove(&mut self, key: VarKey) -> Option<Variable> {
        self.vars.remove(&key)
    }

    /// Variables in key (creation) order.
    pub fn iter(&self) -> impl Iterator<Item = (VarKey, &Variable)> {
        self.vars.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Number of unlocked (optimized) variables.
    pub fn num_unlocked(&self) -> usize {
        self.vars.values().filter(|v| !v.locked).count()
    }

    /// Reproject every pose variable's rotation that drifted off SO(3).
    pub fn reproject_poses(&mut self) {
        for var in self.vars.values_mut() {
            if let VarValue::Pose(pose) = &mut var.value {
                *pose = pose.reprojected();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_keys_are_ordered_by_creation() {
        let mut store = VariableStore::new();
        let a = store.add_vector(Vector6::zeros(), false);
        let b = store.add_pose(Se3::identity(), false);
        assert!(a < b);
        let keys: Vec<_> = store.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![a, b]);
    }

    #[test]
    fn test_apply_step_pose_is_left_multiplicative() {
        let mut store = VariableStore::new();
        let key = store.add_pose(Se3::identity(), false);
        let delta = Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        store.apply_step(key, &delta).expect("variable exists");
        let pose = store.pose(key).expect("pose");
        assert_relative_eq!(pose.t, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_locked_variables_are_not_counted() {
        let mut store = VariableStore::new();
        store.add_pose(Se3::identity(), true);
        store.add_vector(Vector6::zeros(), false);
        assert_eq!(store.len(), 2);
        assert_eq!(store.num_unlocked(), 1);
    }

    #[test]
    fn test_kind_mismatch_is_invariant_violation() {
        let mut store = VariableStore::new();
        let key = store.add_vector(Vector6::zeros(), false);
        assert!(store.pose(key).is_err());
    }

    #[test]
    fn test_boxminus_pose() {
        let a = VarValue::Pose(Se3::exp(&Vector6::new(0.2, 0.0, 0.0, 0.0, 0.0, 0.1)));
        let b = VarValue::Pose(Se3::identity());
        let delta = a.boxminus(&b).expect("same kind");
        assert_relative_eq!(delta[0], 0.2, epsilon = 1e-12);
        assert_relative_eq!(delta[5], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_removed_variable_is_gone() {
        let mut store = VariableStore::new();
        let key = store.add_vector(Vector6::zeros(), false);
        assert!(store.remove(key).is_some());
        assert!(store.vector(key).is_err());
    }
}
