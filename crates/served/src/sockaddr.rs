//! Conversion between the typed address model and raw `sockaddr` storage.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use serve_core::{ListenAddress, PeerAddress};

/// `struct sockaddr_x25` from `<linux/x25.h>`; not exported by libc.
#[cfg(target_os = "linux")]
#[repr(C)]
struct SockaddrX25 {
    sx25_family: libc::sa_family_t,
    sx25_addr: [libc::c_char; 16],
}

/// A socket address in kernel representation.
pub(crate) struct RawAddress {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl RawAddress {
    /// Returns zeroed storage sized for any address family, ready for
    /// `accept(2)` or `getsockname(2)` to fill in.
    pub(crate) fn empty() -> Self {
        Self {
            // SAFETY: sockaddr_storage is plain old data; all-zero is valid
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub(crate) fn family(&self) -> libc::c_int {
        libc::c_int::from(self.storage.ss_family)
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        std::ptr::addr_of!(self.storage).cast()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        std::ptr::addr_of_mut!(self.storage).cast()
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub(crate) fn len_mut(&mut self) -> &mut libc::socklen_t {
        &mut self.len
    }

    /// Reinterprets the storage as a concrete `sockaddr_*` type.
    ///
    /// # Safety
    ///
    /// `T` must be a `sockaddr_*` struct matching the stored family.
    unsafe fn view<T>(&self) -> &T {
        &*std::ptr::addr_of!(self.storage).cast::<T>()
    }

    /// # Safety
    ///
    /// `T` must be a `sockaddr_*` struct no larger than `sockaddr_storage`.
    unsafe fn view_mut<T>(&mut self) -> &mut T {
        &mut *std::ptr::addr_of_mut!(self.storage).cast::<T>()
    }
}

/// Encodes a listen address for `bind(2)`.
pub(crate) fn encode(address: &ListenAddress) -> io::Result<RawAddress> {
    let mut raw = RawAddress::empty();

    match address {
        ListenAddress::Inet(addr) => {
            // SAFETY: sockaddr_in fits in sockaddr_storage
            let sin = unsafe { raw.view_mut::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
            raw.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        }
        ListenAddress::Inet6(addr) => {
            // SAFETY: sockaddr_in6 fits in sockaddr_storage
            let sin6 = unsafe { raw.view_mut::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = addr.port().to_be();
            sin6.sin6_flowinfo = addr.flowinfo();
            sin6.sin6_addr.s6_addr = addr.ip().octets();
            sin6.sin6_scope_id = addr.scope_id();
            raw.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        }
        ListenAddress::Unix(path) => {
            let bytes = path.as_os_str().as_bytes();
            // SAFETY: sockaddr_un fits in sockaddr_storage
            let sun = unsafe { raw.view_mut::<libc::sockaddr_un>() };
            if bytes.len() >= sun.sun_path.len() || bytes.contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unusable unix socket path '{}'", path.display()),
                ));
            }
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            raw.len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        }
        #[cfg(target_os = "linux")]
        ListenAddress::Vsock { port, cid } => {
            // SAFETY: sockaddr_vm fits in sockaddr_storage
            let svm = unsafe { raw.view_mut::<libc::sockaddr_vm>() };
            svm.svm_family = libc::AF_VSOCK as libc::sa_family_t;
            svm.svm_port = *port;
            svm.svm_cid = *cid;
            raw.len = mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t;
        }
        #[cfg(target_os = "linux")]
        ListenAddress::X25(digits) => {
            // SAFETY: SockaddrX25 fits in sockaddr_storage
            let sx25 = unsafe { raw.view_mut::<SockaddrX25>() };
            if digits.len() >= sx25.sx25_addr.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("X25 address '{digits}' is too long"),
                ));
            }
            sx25.sx25_family = libc::AF_X25 as libc::sa_family_t;
            for (dst, src) in sx25.sx25_addr.iter_mut().zip(digits.bytes()) {
                *dst = src as libc::c_char;
            }
            raw.len = mem::size_of::<SockaddrX25>() as libc::socklen_t;
        }
        #[cfg(not(target_os = "linux"))]
        ListenAddress::Vsock { .. } | ListenAddress::X25(_) => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} addresses are only supported on Linux", address.family()),
            ));
        }
    }

    Ok(raw)
}

/// Decodes an address filled in by `accept(2)` or `getsockname(2)`.
///
/// Families without a label form fail with `ENOTSUP`.
pub(crate) fn decode(raw: &RawAddress) -> io::Result<PeerAddress> {
    match raw.family() {
        libc::AF_INET => {
            // SAFETY: family is AF_INET
            let sin = unsafe { raw.view::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(PeerAddress::Inet(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: family is AF_INET6
            let sin6 = unsafe { raw.view::<libc::sockaddr_in6>() };
            Ok(PeerAddress::Inet6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        libc::AF_UNIX => {
            // SAFETY: family is AF_UNIX
            let sun = unsafe { raw.view::<libc::sockaddr_un>() };
            let offset = mem::offset_of!(libc::sockaddr_un, sun_path);
            let available = (raw.len() as usize).saturating_sub(offset);
            let path: Vec<u8> = sun
                .sun_path
                .iter()
                .take(available)
                .take_while(|c| **c != 0)
                .map(|c| *c as u8)
                .collect();
            if path.is_empty() {
                Ok(PeerAddress::Unix(None))
            } else {
                Ok(PeerAddress::Unix(Some(PathBuf::from(
                    std::ffi::OsString::from_vec(path),
                ))))
            }
        }
        #[cfg(target_os = "linux")]
        libc::AF_VSOCK => {
            // SAFETY: family is AF_VSOCK
            let svm = unsafe { raw.view::<libc::sockaddr_vm>() };
            Ok(PeerAddress::Vsock {
                cid: svm.svm_cid,
                port: svm.svm_port,
            })
        }
        #[cfg(target_os = "linux")]
        libc::AF_X25 => {
            // SAFETY: family is AF_X25
            let sx25 = unsafe { raw.view::<SockaddrX25>() };
            let digits: String = sx25
                .sx25_addr
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| char::from(*c as u8))
                .collect();
            Ok(PeerAddress::X25(digits))
        }
        _ => Err(io::Error::from_raw_os_error(libc::ENOTSUP)),
    }
}
