use glam::Vec2;
use hashbrown::HashMap;

/// A gradient colour stop. `colour` is premultiplied RGBA8 and `position`
/// is normalised along the gradient line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorStop {
    pub colour: [u8; 4],
    pub position: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Int(i32),
    Float(f32),
    Vector2(Vec2),
    /// Non-premultiplied RGBA8.
    Colour([u8; 4]),
    String(String),
    ColorStopList(Vec<ColorStop>),
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Variant::Int(value)
    }
}

impl From<f32> for Variant {
    fn from(value: f32) -> Self {
        Variant::Float(value)
    }
}

impl From<Vec2> for Variant {
    fn from(value: Vec2) -> Self {
        Variant::Vector2(value)
    }
}

impl From<[u8; 4]> for Variant {
    fn from(value: [u8; 4]) -> Self {
        Variant::Colour(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::String(value.to_owned())
    }
}

impl From<Vec<ColorStop>> for Variant {
    fn from(value: Vec<ColorStop>) -> Self {
        Variant::ColorStopList(value)
    }
}

/// String-keyed parameters of a filter or shader.
///
/// Getters fall back to the given default when the key is missing or holds
/// a variant of another kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    entries: HashMap<String, Variant>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Variant>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Variant>) {
        self.entries.insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn float(&self, key: &str, default: f32) -> f32 {
        match self.get(key) {
            Some(Variant::Float(v)) => *v,
            Some(Variant::Int(v)) => *v as f32,
            _ => default,
        }
    }

    pub fn boolean(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Variant::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn vec2(&self, key: &str, default: Vec2) -> Vec2 {
        match self.get(key) {
            Some(Variant::Vector2(v)) => *v,
            _ => default,
        }
    }

    pub fn colour(&self, key: &str, default: [u8; 4]) -> [u8; 4] {
        match self.get(key) {
            Some(Variant::Colour(v)) => *v,
            _ => default,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Variant::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn color_stops(&self, key: &str) -> &[ColorStop] {
        match self.get(key) {
            Some(Variant::ColorStopList(v)) => v,
            _ => &[],
        }
    }
}
