use serde::ser::{Serialize, SerializeMap, Serializer};

/// Canonical facial-expression coefficient names, in output order.
///
/// Every expression backend emits exactly this set; downstream consumers
/// key on these names.
pub const BLENDSHAPE_NAMES: [&str; 52] = [
    "_neutral",
    "browDownLeft",
    "browDownRight",
    "browInnerUp",
    "browOuterUpLeft",
    "browOuterUpRight",
    "cheekPuff",
    "cheekSquintLeft",
    "cheekSquintRight",
    "eyeBlinkLeft",
    "eyeBlinkRight",
    "eyeLookDownLeft",
    "eyeLookDownRight",
    "eyeLookInLeft",
    "eyeLookInRight",
    "eyeLookOutLeft",
    "eyeLookOutRight",
    "eyeLookUpLeft",
    "eyeLookUpRight",
    "eyeSquintLeft",
    "eyeSquintRight",
    "eyeWideLeft",
    "eyeWideRight",
    "jawForward",
    "jawLeft",
    "jawOpen",
    "jawRight",
    "mouthClose",
    "mouthDimpleLeft",
    "mouthDimpleRight",
    "mouthFrownLeft",
    "mouthFrownRight",
    "mouthFunnel",
    "mouthLeft",
    "mouthLowerDownLeft",
    "mouthLowerDownRight",
    "mouthPressLeft",
    "mouthPressRight",
    "mouthPucker",
    "mouthRight",
    "mouthRollLower",
    "mouthRollUpper",
    "mouthShrugLower",
    "mouthShrugUpper",
    "mouthSmileLeft",
    "mouthSmileRight",
    "mouthStretchLeft",
    "mouthStretchRight",
    "mouthUpperUpLeft",
    "mouthUpperUpRight",
    "noseSneerLeft",
    "noseSneerRight",
];

/// One coefficient per canonical blendshape name, each in [0,1].
///
/// Serializes as a name → value map so the JSON contract is
/// self-describing.
#[derive(Clone, Debug, PartialEq)]
pub struct Blendshapes([f32; 52]);

impl Blendshapes {
    /// Builds a set from raw regressor output.
    ///
    /// Returns `None` unless exactly 52 coefficients are given; values
    /// are clamped into [0,1].
    pub fn from_coefficients(raw: &[f32]) -> Option<Self> {
        if raw.len() != BLENDSHAPE_NAMES.len() {
            return None;
        }
        let mut values = [0.0f32; 52];
        for (slot, v) in values.iter_mut().zip(raw) {
            *slot = v.clamp(0.0, 1.0);
        }
        Some(Self(values))
    }

    pub fn values(&self) -> &[f32; 52] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        BLENDSHAPE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.0[i])
    }
}

impl Serialize for Blendshapes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(BLENDSHAPE_NAMES.len()))?;
        for (name, value) in BLENDSHAPE_NAMES.iter().zip(self.0.iter()) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_name_table_has_52_unique_entries() {
        let unique: HashSet<&str> = BLENDSHAPE_NAMES.iter().copied().collect();
        assert_eq!(unique.len(), 52);
    }

    #[test]
    fn test_from_coefficients_rejects_wrong_length() {
        assert!(Blendshapes::from_coefficients(&[0.5; 51]).is_none());
        assert!(Blendshapes::from_coefficients(&[0.5; 53]).is_none());
        assert!(Blendshapes::from_coefficients(&[]).is_none());
    }

    #[test]
    fn test_from_coefficients_clamps_into_unit_interval() {
        let mut raw = [0.5f32; 52];
        raw[0] = -0.3;
        raw[1] = 1.7;
        let bs = Blendshapes::from_coefficients(&raw).unwrap();
        assert_eq!(bs.values()[0], 0.0);
        assert_eq!(bs.values()[1], 1.0);
        assert_eq!(bs.values()[2], 0.5);
    }

    #[test]
    fn test_get_by_name() {
        let mut raw = [0.0f32; 52];
        raw[25] = 0.9; // jawOpen
        let bs = Blendshapes::from_coefficients(&raw).unwrap();
        assert_eq!(bs.get("jawOpen"), Some(0.9));
        assert_eq!(bs.get("_neutral"), Some(0.0));
        assert_eq!(bs.get("notABlendshape"), None);
    }

    #[test]
    fn test_serializes_as_full_name_map() {
        let bs = Blendshapes::from_coefficients(&[0.25; 52]).unwrap();
        let json = serde_json::to_value(&bs).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 52);
        assert_eq!(obj["eyeBlinkLeft"], 0.25);
        assert_eq!(obj["noseSneerRight"], 0.25);
    }
}
