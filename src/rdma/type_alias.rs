/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u64`]: **Work request identifier**, designated by the user to identify a work request.
pub type WrId = u64;
