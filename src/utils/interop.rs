use std::io;

/// Converts a verbs return value to a Rust `Result`.
///
/// Verbs return `0` on success and the error number on failure.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

/// Converts an `rdma_cm` return value to a Rust `Result`.
///
/// Connection manager calls return `-1` on failure and set `errno`.
#[inline(always)]
pub(crate) fn from_c_ret_errno(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Converts a verbs return value to a Rust `Result`, attaching the
/// explanation given by `f` when there is one.
#[inline(always)]
pub(crate) fn from_c_ret_explained(
    ret: i32,
    f: impl FnOnce(i32) -> Option<&'static str>,
) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::from_raw_os_error(ret);
    match f(ret) {
        Some(msg) => Err(io::Error::new(err.kind(), format!("{}: {}", msg, err))),
        None => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_c_ret() {
        assert!(from_c_ret(0).is_ok());
        assert_eq!(
            from_c_ret(libc::ENOMEM).unwrap_err().raw_os_error(),
            Some(libc::ENOMEM)
        );
    }

    #[test]
    fn test_explained() {
        let err = from_c_ret_explained(libc::EINVAL, |_| Some("invalid work request")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().starts_with("invalid work request"));

        let err = from_c_ret_explained(libc::EFAULT, |_| None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EFAULT));
    }
}
