//! Core ID and feature types for the map structures.

/// Unique identifier for a KeyFrame within the pose graph.
///
/// KeyFrameIds are assigned sequentially starting at 0 and are never reused
/// within the lifetime of a graph. They serve as lightweight handles for
/// cross-referencing without needing Arc/Rc, which simplifies ownership and
/// avoids cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// Create a new KeyFrameId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a Landmark (3D map point) within the pose graph.
///
/// LandmarkIds are assigned sequentially when landmarks are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    /// Create a new LandmarkId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

/// A 2D feature location in image coordinates.
///
/// Produced by the front-end; the back-end treats it as opaque payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Horizontal image coordinate.
    pub u: f64,
    /// Vertical image coordinate.
    pub v: f64,
}

/// Number of bytes in a feature descriptor.
pub const DESCRIPTOR_LEN: usize = 32;

/// A fixed-width binary feature descriptor (ORB-sized: 32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_LEN]);

impl Descriptor {
    /// Descriptor with all bytes set to the given value.
    pub fn filled(value: u8) -> Self {
        Self([value; DESCRIPTOR_LEN])
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self([0; DESCRIPTOR_LEN])
    }
}

impl From<[u8; DESCRIPTOR_LEN]> for Descriptor {
    fn from(bytes: [u8; DESCRIPTOR_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality() {
        let id1 = KeyFrameId::new(42);
        let id2 = KeyFrameId::new(42);
        let id3 = KeyFrameId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_landmark_id_display() {
        let id = LandmarkId::new(123);
        assert_eq!(format!("{}", id), "LM123");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<KeyFrameId, &str> = HashMap::new();
        map.insert(KeyFrameId::new(1), "first");
        map.insert(KeyFrameId::new(2), "second");

        assert_eq!(map.get(&KeyFrameId::new(1)), Some(&"first"));
        assert_eq!(map.get(&KeyFrameId::new(3)), None);
    }

    #[test]
    fn test_descriptor_default_is_zero() {
        assert_eq!(Descriptor::default(), Descriptor::filled(0));
    }
}
