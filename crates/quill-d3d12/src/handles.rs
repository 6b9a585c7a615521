use std::fmt;

use hashbrown::HashMap;

macro_rules! render_handles {
    ($($(#[$meta:meta])* $name:ident,)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u32);

            impl $name {
                pub fn raw(self) -> u32 {
                    self.0
                }
            }

            impl From<u32> for $name {
                fn from(raw: u32) -> Self {
                    Self(raw)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        )*
    };
}

render_handles! {
    CompiledGeometryHandle,
    TextureHandle,
    CompiledFilterHandle,
    CompiledShaderHandle,
    /// Index into the layer stack; `0` is the base layer.
    LayerHandle,
}

/// Id-keyed storage for objects handed out to the caller as handles.
///
/// Ids start at 1 and are never reused while the table lives.
#[derive(Debug)]
pub(crate) struct HandleTable<T> {
    next: u32,
    entries: HashMap<u32, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }
}

impl<T> HandleTable<T> {
    pub fn insert<H: From<u32>>(&mut self, value: T) -> H {
        let id = self.next;
        self.next += 1;
        self.entries.insert(id, value);
        H::from(id)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain().map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_not_reused() {
        let mut table = HandleTable::default();
        let a: TextureHandle = table.insert("a");
        let b: TextureHandle = table.insert("b");
        assert_ne!(a, b);
        assert_eq!(table.remove(a.raw()), Some("a"));
        let c: TextureHandle = table.insert("c");
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(c.to_string(), "TextureHandle(3)");
    }
}
