#![macro_use]

/// Implement pointer access and thread-safety markers for a newtype over
/// `NonNull<$raw_ty>`.
///
/// The raw handles wrapped this way are owned by exactly one wrapper, which
/// releases them on drop; librdmacm and libibverbs are thread-safe for the
/// calls made through them.
macro_rules! impl_raw_wrapper_traits {
    ($raw_ty:ty, $wrapper_ty:ty) => {
        impl ::std::ops::Deref for $wrapper_ty {
            type Target = ::std::ptr::NonNull<$raw_ty>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl $wrapper_ty {
            /// Get the underlying raw pointer.
            #[inline]
            pub(crate) fn as_raw(&self) -> *mut $raw_ty {
                self.0.as_ptr()
            }
        }

        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}
