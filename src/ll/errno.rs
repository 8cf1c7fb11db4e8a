use std::fmt;
use std::io;
use std::num::NonZeroI32;

/// A positive, non-zero system error code.
///
/// The transport reports every failure as one of these. Replies from the daemon carry the
/// negated value on the wire; [`Errno::from_wire`] and [`Errno::to_wire`] convert between
/// the two representations.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub(crate) NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                #[allow(missing_docs)]
                pub const $name: Errno = Errno::from_const(libc::$name);
            )*

            /// Symbolic name of the code, when it is one the transport produces.
            pub fn name(&self) -> Option<&'static str> {
                match self.0.get() {
                    $(libc::$name => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    };
}

errno_consts!(
    EPERM,
    ENOENT,
    EINTR,
    EIO,
    E2BIG,
    EAGAIN,
    ENOMEM,
    EFAULT,
    ENODEV,
    EINVAL,
    EPIPE,
    ENAMETOOLONG,
    ENOSYS,
    ENOTCONN,
    ECONNABORTED,
    ECONNREFUSED,
);

impl Errno {
    const fn from_const(code: i32) -> Errno {
        match NonZeroI32::new(code) {
            Some(code) => Errno(code),
            None => panic!("errno constant is zero"),
        }
    }

    /// Wrap a raw positive error code. Zero and negative values map to `EIO`.
    pub fn from_i32(code: i32) -> Errno {
        match NonZeroI32::new(code) {
            Some(code) if code.get() > 0 => Errno(code),
            _ => Errno::EIO,
        }
    }

    /// Convert a reply header error field (`0` or a negated code) into a result.
    pub fn from_wire(error: i32) -> Result<(), Errno> {
        if error == 0 {
            Ok(())
        } else {
            Err(Errno::from_i32(error.wrapping_neg()))
        }
    }

    /// The negated code as it travels in a reply header.
    pub fn to_wire(self) -> i32 {
        -self.0.get()
    }

    /// The raw positive code.
    pub fn code(self) -> i32 {
        self.0.get()
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Errno({name})"),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0.get()))
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> Self {
        io::Error::from_raw_os_error(errno.0.get())
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        err.raw_os_error().map_or(Errno::EIO, Errno::from_i32)
    }
}
