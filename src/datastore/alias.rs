//! Derived values: a linear transform over one variable or RPV.
//!
//! ```text
//!   user → device : clamp(v, min, max), then (v - offset) / gain
//!   device → user : v * gain + offset        (never clamped)
//! ```

use crate::error::StoreError;
use crate::protocol::Value;

use super::entry::EntryId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AliasDef {
    pub target: EntryId,
    pub gain: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
}

impl AliasDef {
    /// Identity alias: gain 1, offset 0, unbounded.
    pub fn new(target: EntryId) -> Self {
        Self {
            target,
            gain: 1.0,
            offset: 0.0,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }

    #[must_use]
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let ok = self.gain.is_finite()
            && self.gain != 0.0
            && self.offset.is_finite()
            && !self.min.is_nan()
            && !self.max.is_nan()
            && self.min <= self.max;
        if ok { Ok(()) } else { Err(StoreError::InvalidAlias) }
    }

    fn is_identity(&self) -> bool {
        self.gain == 1.0 && self.offset == 0.0
    }

    pub fn user_to_device(&self, v: f64) -> f64 {
        (v.clamp(self.min, self.max) - self.offset) / self.gain
    }

    pub fn device_to_user(&self, v: f64) -> f64 {
        v * self.gain + self.offset
    }

    /// Value to write to the target for a user write of `value`.
    pub fn compute_device_value(&self, value: Value) -> Value {
        match value {
            Value::Bool(_) => value,
            _ if self.is_identity() && value.as_f64() >= self.min && value.as_f64() <= self.max => {
                value
            }
            _ => Value::Float(self.user_to_device(value.as_f64())),
        }
    }

    /// Value shown to the user for a target value of `value`.
    pub fn compute_user_value(&self, value: Value) -> Value {
        match value {
            Value::Bool(_) => value,
            _ if self.is_identity() => value,
            _ => Value::Float(self.device_to_user(value.as_f64())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias() -> AliasDef {
        AliasDef::new(EntryId(1))
            .with_gain(2.0)
            .with_offset(10.0)
            .with_limits(-100.0, 100.0)
    }

    #[test]
    fn clamps_before_inverting() {
        let a = alias();
        assert_eq!(a.user_to_device(50.0), 20.0);
        assert_eq!(a.user_to_device(500.0), 45.0);
        assert_eq!(a.user_to_device(-500.0), -55.0);
    }

    #[test]
    fn device_to_user_is_never_clamped() {
        let a = alias();
        assert_eq!(a.device_to_user(1000.0), 2010.0);
    }

    #[test]
    fn identity_keeps_integer_values() {
        let a = AliasDef::new(EntryId(1));
        assert_eq!(a.compute_user_value(Value::UInt(7)), Value::UInt(7));
        assert_eq!(a.compute_device_value(Value::Int(-7)), Value::Int(-7));
        assert_eq!(alias().compute_user_value(Value::UInt(7)), Value::Float(24.0));
    }

    #[test]
    fn validation() {
        assert!(alias().validate().is_ok());
        assert!(alias().with_gain(0.0).validate().is_err());
        assert!(alias().with_gain(f64::NAN).validate().is_err());
        assert!(alias().with_limits(5.0, 1.0).validate().is_err());
        assert!(AliasDef::new(EntryId(0)).validate().is_ok());
    }
}
