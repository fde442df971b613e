//! The six hook bodies: thin wrappers that consult the active rule set (or
//! tally bytes) and then call through the saved resume address.
//!
//! Every function here runs on whatever thread of the host process called
//! the original entry point; none of them may block beyond what the
//! original call itself would have.

use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::os::raw::c_char;
use std::sync::OnceLock;

use parking_lot::Mutex;

use windows::core::PCSTR;
use windows::Win32::Foundation::BOOL;
use windows::Win32::Networking::WinSock::{
    AF_INET, HOSTENT, MSG_PEEK, SOCKADDR, SOCKADDR_IN, SOCKET, SOCKET_ERROR, WSAECONNREFUSED,
    WSAHOST_NOT_FOUND, WSASetLastError, WSABUF,
};
use windows::Win32::System::IO::OVERLAPPED;

use crate::lifecycle::state;
use crate::rules::Decision;

type ConnectFn = unsafe extern "system" fn(SOCKET, *const SOCKADDR, i32) -> i32;
type GetHostByNameFn = unsafe extern "system" fn(PCSTR) -> *mut HOSTENT;
type RecvFn = unsafe extern "system" fn(SOCKET, windows::core::PSTR, i32, i32) -> i32;
type RecvFromFn =
    unsafe extern "system" fn(SOCKET, windows::core::PSTR, i32, i32, *mut SOCKADDR, *mut i32) -> i32;
type WsaRecvFn = unsafe extern "system" fn(
    SOCKET,
    *mut WSABUF,
    u32,
    *mut u32,
    *mut u32,
    *mut OVERLAPPED,
    *mut c_void,
) -> i32;
type WsaGetOverlappedResultFn =
    unsafe extern "system" fn(SOCKET, *mut OVERLAPPED, *mut u32, BOOL, *mut u32) -> BOOL;

/// `connect`: consults the rule set by destination address/port and either
/// forwards, denies with `WSAECONNREFUSED`, or forwards a locally-rewritten
/// copy of the destination. The caller's own buffer is never touched.
pub unsafe extern "system" fn connect_detour(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
) -> i32 {
    let Some(original) = state().registry.connect.resume_as::<ConnectFn>() else {
        WSASetLastError(WSAECONNREFUSED);
        return SOCKET_ERROR;
    };

    if name.is_null() || (namelen as usize) < size_of::<SOCKADDR_IN>() {
        return original(s, name, namelen);
    }

    let original_in = &*(name as *const SOCKADDR_IN);
    if original_in.sin_family != AF_INET {
        return original(s, name, namelen);
    }

    let addr = Ipv4Addr::from(u32::from_be(original_in.sin_addr.S_un.S_addr));
    let port = u16::from_be(original_in.sin_port);

    match state().rules.snapshot().decide_connect(addr, port) {
        Decision::Forward => original(s, name, namelen),
        Decision::Deny => {
            WSASetLastError(WSAECONNREFUSED);
            SOCKET_ERROR
        }
        Decision::RewriteTo { addr, port } => {
            let mut rewritten = *original_in;
            rewritten.sin_addr.S_un.S_addr = u32::from(addr).to_be();
            rewritten.sin_port = port.to_be();
            original(s, &rewritten as *const SOCKADDR_IN as *const SOCKADDR, namelen)
        }
    }
}

/// Process-wide storage for the fabricated `hostent` returned on a DNS
/// rewrite. Reused across calls, matching the weak per-process storage
/// semantics of the legacy name-lookup API it replaces.
struct DnsResponse {
    name_buf: [c_char; 64],
    address: [u8; 4],
    addr_list: [*mut c_char; 2],
    hostent: HOSTENT,
}

// Only ever touched behind `dns_response()`'s mutex.
unsafe impl Send for DnsResponse {}

impl DnsResponse {
    fn blank() -> Self {
        DnsResponse {
            name_buf: [0; 64],
            address: [0; 4],
            addr_list: [std::ptr::null_mut(); 2],
            hostent: HOSTENT {
                h_name: windows::core::PSTR(std::ptr::null_mut()),
                h_aliases: std::ptr::null_mut(),
                h_addrtype: 0,
                h_length: 0,
                h_addr_list: std::ptr::null_mut(),
            },
        }
    }

    fn fill(&mut self, addr: Ipv4Addr) -> *mut HOSTENT {
        const PLACEHOLDER: &[u8] = b"wsveil-rewrite\0";
        for (slot, byte) in self.name_buf.iter_mut().zip(PLACEHOLDER.iter()) {
            *slot = *byte as c_char;
        }
        self.address = addr.octets();
        self.addr_list[0] = self.address.as_mut_ptr() as *mut c_char;
        self.addr_list[1] = std::ptr::null_mut();

        self.hostent.h_name = windows::core::PSTR(self.name_buf.as_mut_ptr() as *mut u8);
        self.hostent.h_aliases = std::ptr::null_mut();
        self.hostent.h_addrtype = AF_INET.0 as i16;
        self.hostent.h_length = 4;
        self.hostent.h_addr_list = self.addr_list.as_mut_ptr() as *mut windows::core::PSTR;

        &mut self.hostent as *mut HOSTENT
    }
}

fn dns_response() -> &'static Mutex<DnsResponse> {
    static CELL: OnceLock<Mutex<DnsResponse>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(DnsResponse::blank()))
}

/// `gethostbyname`: denies with "host not found", forwards, or fabricates a
/// single-address response pointing at the replacement.
pub unsafe extern "system" fn gethostbyname_detour(name: PCSTR) -> *mut HOSTENT {
    let Some(original) = state().registry.gethostbyname.resume_as::<GetHostByNameFn>() else {
        WSASetLastError(WSAHOST_NOT_FOUND);
        return std::ptr::null_mut();
    };

    let host_name = if name.0.is_null() {
        String::new()
    } else {
        std::ffi::CStr::from_ptr(name.0 as *const i8)
            .to_string_lossy()
            .into_owned()
    };

    match state().rules.snapshot().decide_host(&host_name) {
        Decision::Forward => original(name),
        Decision::Deny => {
            WSASetLastError(WSAHOST_NOT_FOUND);
            std::ptr::null_mut()
        }
        Decision::RewriteTo { addr, .. } => {
            let mut response = dns_response().lock();
            response.fill(addr)
        }
    }
}

/// `recv`: forwards, then attributes a non-negative return to the
/// bandwidth counter.
pub unsafe extern "system" fn recv_detour(
    s: SOCKET,
    buf: windows::core::PSTR,
    len: i32,
    flags: i32,
) -> i32 {
    let Some(original) = state().registry.recv.resume_as::<RecvFn>() else {
        return SOCKET_ERROR;
    };
    let result = original(s, buf, len, flags);
    state().bandwidth.attribute(result);
    result
}

/// `recvfrom`: same accounting as [`recv_detour`].
pub unsafe extern "system" fn recvfrom_detour(
    s: SOCKET,
    buf: windows::core::PSTR,
    len: i32,
    flags: i32,
    from: *mut SOCKADDR,
    fromlen: *mut i32,
) -> i32 {
    let Some(original) = state().registry.recvfrom.resume_as::<RecvFromFn>() else {
        return SOCKET_ERROR;
    };
    let result = original(s, buf, len, flags, from, fromlen);
    state().bandwidth.attribute(result);
    result
}

/// `WSARecv`: overlapped calls are forwarded untouched, attributing only a
/// synchronously-completed transfer; non-overlapped calls are attributed
/// unless the caller only peeked at the data.
pub unsafe extern "system" fn wsa_recv_detour(
    s: SOCKET,
    buffers: *mut WSABUF,
    buffer_count: u32,
    bytes_received: *mut u32,
    flags: *mut u32,
    overlapped: *mut OVERLAPPED,
    completion_routine: *mut c_void,
) -> i32 {
    let Some(original) = state().registry.wsa_recv.resume_as::<WsaRecvFn>() else {
        return SOCKET_ERROR;
    };

    let result = original(
        s,
        buffers,
        buffer_count,
        bytes_received,
        flags,
        overlapped,
        completion_routine,
    );

    let is_overlapped = !overlapped.is_null() || !completion_routine.is_null();
    if is_overlapped {
        if result == 0 && !overlapped.is_null() && !bytes_received.is_null() {
            state().bandwidth.attribute(*bytes_received as i32);
        }
    } else if result == 0 && !bytes_received.is_null() {
        let peeked = !flags.is_null() && (*flags & MSG_PEEK.0 as u32) != 0;
        if !peeked {
            state().bandwidth.attribute(*bytes_received as i32);
        }
    }

    result
}

/// `WSAGetOverlappedResult`: pure passthrough, reserved for future
/// attribution.
pub unsafe extern "system" fn wsa_get_overlapped_result_detour(
    s: SOCKET,
    overlapped: *mut OVERLAPPED,
    bytes: *mut u32,
    wait: BOOL,
    flags: *mut u32,
) -> BOOL {
    match state()
        .registry
        .wsa_get_overlapped_result
        .resume_as::<WsaGetOverlappedResultFn>()
    {
        Some(original) => original(s, overlapped, bytes, wait, flags),
        None => BOOL(0),
    }
}
