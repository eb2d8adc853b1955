use serde::{Deserialize, Deserializer, Serialize};
use std::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result},
    marker::PhantomData,
    ops::{Add, Sub},
};

/// Useful alias.
pub type Void = u8;

/// An address in the tracee's address space. Never dereferenced by us.
#[derive(Hash, Debug)]
pub struct RemotePtr<T> {
    ptr: usize,
    /// This struct does not "own" a `T`, hence `PhantomData<*const T>`.
    phantom: PhantomData<*const T>,
}

// Manually implement Copy, Clone due to quirks with PhantomData
impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        RemotePtr::new_from_val(self.ptr)
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        RemotePtr::null()
    }
}

impl<T> RemotePtr<T> {
    pub fn null() -> RemotePtr<T> {
        RemotePtr::new_from_val(0)
    }

    pub fn new_from_val(val: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    pub fn referent_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn cast<U>(r: RemotePtr<U>) -> RemotePtr<T> {
        RemotePtr::<T>::new_from_val(r.ptr)
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Serialize for RemotePtr<T> {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.ptr as u64)
    }
}

impl<'de, T> Deserialize<'de> for RemotePtr<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u64::deserialize(deserializer).map(|v| RemotePtr::new_from_val(v as usize))
    }
}

impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        // Overflow is caught in debug mode.
        Self::new_from_val(self.ptr + delta * std::mem::size_of::<T>())
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        // Underflow is caught in debug mode.
        Self::new_from_val(self.ptr - delta * std::mem::size_of::<T>())
    }
}

/// Note that the other RemotePtr must have SAME referent type.
impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<T>) -> Self::Output {
        (self.ptr - rhs.ptr) / std::mem::size_of::<T>()
    }
}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &RemotePtr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> From<usize> for RemotePtr<T> {
    fn from(addr: usize) -> Self {
        RemotePtr::<T>::new_from_val(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_test() {
        let a = RemotePtr::<u64>::null();
        assert_eq!(0, a.as_usize());
        assert!(a.is_null());
    }

    #[test]
    fn add_sub_test() {
        let a = RemotePtr::<u64>::null();
        let b = a + 1usize;
        assert_eq!(8, b.as_usize());
        let c = b - 1usize;
        assert_eq!(0, c.as_usize());
        assert_eq!(1, b - a);
    }

    #[test]
    fn cast_test() {
        struct S(u64, u64);
        let a = RemotePtr::<u64>::new_from_val(8);
        let b = RemotePtr::<S>::cast(a);
        assert_eq!(16, b.referent_size());
        assert_eq!(8, a.referent_size());
        assert_eq!(a.as_usize(), b.as_usize());
    }

    #[test]
    fn display_test() {
        let a = RemotePtr::<Void>::new_from_val(0x400000);
        assert_eq!("0x400000", format!("{}", a));
    }

    #[test]
    fn comparison_test() {
        let c = RemotePtr::<Void>::new_from_val(0);
        let d = RemotePtr::<Void>::new_from_val(16);
        assert!(c < d);
        assert!(d > c);
        assert!(c != d);
        assert_eq!(c, c.clone());
    }
}
