/// Provide interoperability with C return values.
pub(crate) mod interop;

/// Wrapper boilerplates for raw FFI handles.
pub(crate) mod boilerplate;
