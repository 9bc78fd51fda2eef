/// Asserts that the given buffer has enough remaining capacity and
/// otherwise returns UnexpectedEof.
macro_rules! assert_size {
    ($buf:expr, $size:expr) => {{
        if $buf.remaining() < $size {
            return Err(::std::io::ErrorKind::UnexpectedEof.into());
        }
    }};
}

/// Returns an `InvalidData` I/O error built from the given format arguments.
macro_rules! invalid_data {
    ($($arg:tt)*) => {{
        return Err(::std::io::Error::new(
            ::std::io::ErrorKind::InvalidData,
            format!($($arg)*),
        ));
    }};
}
