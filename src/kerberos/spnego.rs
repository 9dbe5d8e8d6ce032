//! SPNEGO initial tokens minted through the system GSS-API library.
//!
//! MIT `libgssapi_krb5` is loaded on first use, so the crate builds and runs
//! without Kerberos development files; only a client that actually negotiates
//! needs the library at runtime.

use std::ffi::{CString, c_char, c_void};
use std::fmt;
use std::ptr;
use std::sync::OnceLock;

use libloading::Library;
use tracing::debug;

/// Produces the initial `Negotiate` token for one request.
pub trait NegotiateTokenSource: Send + Sync + fmt::Debug {
    /// Token for the host-based service `service` (`HTTP@host`), using the
    /// tickets in credential cache `ccache` (`FILE:/path`).
    fn initial_token(&self, ccache: &str, service: &str) -> Result<Vec<u8>, String>;
}

type OmUint32 = u32;
type GssName = *mut c_void;
type GssCtx = *mut c_void;
type GssCred = *mut c_void;

#[repr(C)]
struct GssBuffer {
    length: usize,
    value: *mut c_void,
}

#[repr(C)]
struct GssOid {
    length: OmUint32,
    elements: *mut c_void,
}

type ImportNameFn =
    unsafe extern "C" fn(*mut OmUint32, *mut GssBuffer, *mut GssOid, *mut GssName) -> OmUint32;
type InitSecContextFn = unsafe extern "C" fn(
    *mut OmUint32,
    GssCred,
    *mut GssCtx,
    GssName,
    *mut GssOid,
    OmUint32,
    OmUint32,
    *mut c_void,
    *mut GssBuffer,
    *mut *mut GssOid,
    *mut GssBuffer,
    *mut OmUint32,
    *mut OmUint32,
) -> OmUint32;
type ReleaseBufferFn = unsafe extern "C" fn(*mut OmUint32, *mut GssBuffer) -> OmUint32;
type ReleaseNameFn = unsafe extern "C" fn(*mut OmUint32, *mut GssName) -> OmUint32;
type DeleteSecContextFn =
    unsafe extern "C" fn(*mut OmUint32, *mut GssCtx, *mut GssBuffer) -> OmUint32;
type Krb5CcacheNameFn =
    unsafe extern "C" fn(*mut OmUint32, *const c_char, *mut *const c_char) -> OmUint32;

// 1.2.840.113554.1.2.1.4
const NT_HOSTBASED_SERVICE: [u8; 10] = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x01, 0x04];
// 1.3.6.1.5.5.2
const SPNEGO_MECHANISM: [u8; 6] = [0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
const MUTUAL_FLAG: OmUint32 = 2;
const ERROR_MASK: OmUint32 = 0xffff_0000;

#[cfg(all(unix, not(target_vendor = "apple")))]
const LIBRARY_NAMES: &[&str] = &["libgssapi_krb5.so.2", "libgssapi_krb5.so"];
// Apple's GSS framework uses packed structures; it is not loaded.
#[cfg(not(all(unix, not(target_vendor = "apple"))))]
const LIBRARY_NAMES: &[&str] = &[];

struct GssApi {
    import_name: ImportNameFn,
    init_sec_context: InitSecContextFn,
    release_buffer: ReleaseBufferFn,
    release_name: ReleaseNameFn,
    delete_sec_context: DeleteSecContextFn,
    krb5_ccache_name: Krb5CcacheNameFn,
    _library: Library,
}

impl GssApi {
    fn load(names: &[String]) -> Result<Self, String> {
        let mut failures = Vec::new();
        for name in names {
            // SAFETY: MIT's GSS-API library has no load-time initialisers with
            // preconditions on the caller.
            match unsafe { Library::new(name) } {
                Ok(library) => {
                    return Self::bind(library).map_err(|error| format!("{name}: {error}"));
                }
                Err(error) => failures.push(format!("{name}: {error}")),
            }
        }
        if failures.is_empty() {
            return Err("no GSS-API library is known for this platform".to_owned());
        }
        Err(format!("failed to load GSS-API: {}", failures.join("; ")))
    }

    fn bind(library: Library) -> Result<Self, libloading::Error> {
        // SAFETY: each symbol is declared with its signature from MIT's
        // <gssapi/gssapi.h> and <gssapi/gssapi_krb5.h>; the copied pointers are
        // only called while `_library` keeps the library mapped.
        let import_name = unsafe { *library.get::<ImportNameFn>(b"gss_import_name\0")? };
        let init_sec_context =
            unsafe { *library.get::<InitSecContextFn>(b"gss_init_sec_context\0")? };
        let release_buffer = unsafe { *library.get::<ReleaseBufferFn>(b"gss_release_buffer\0")? };
        let release_name = unsafe { *library.get::<ReleaseNameFn>(b"gss_release_name\0")? };
        let delete_sec_context =
            unsafe { *library.get::<DeleteSecContextFn>(b"gss_delete_sec_context\0")? };
        let krb5_ccache_name =
            unsafe { *library.get::<Krb5CcacheNameFn>(b"gss_krb5_ccache_name\0")? };
        Ok(Self {
            import_name,
            init_sec_context,
            release_buffer,
            release_name,
            delete_sec_context,
            krb5_ccache_name,
            _library: library,
        })
    }

    fn initial_token(&self, ccache: &str, service: &str) -> Result<Vec<u8>, String> {
        let ccache = CString::new(ccache).map_err(|_| "credential cache name contains NUL")?;
        let mut minor: OmUint32 = 0;

        // SAFETY: the cache name outlives both calls. MIT krb5 keeps it per
        // thread, so it is reset on this thread once the token is minted.
        unsafe {
            let major = (self.krb5_ccache_name)(&mut minor, ccache.as_ptr(), ptr::null_mut());
            if major & ERROR_MASK != 0 {
                return Err(status_message("gss_krb5_ccache_name", major, minor));
            }
            let token = self.mint(service);
            (self.krb5_ccache_name)(&mut minor, ptr::null(), ptr::null_mut());
            token
        }
    }

    /// # Safety
    ///
    /// The function pointers must come from a loaded GSS-API library.
    unsafe fn mint(&self, service: &str) -> Result<Vec<u8>, String> {
        let mut minor: OmUint32 = 0;
        let mut service_bytes = service.as_bytes().to_vec();
        let mut name_buffer = GssBuffer {
            length: service_bytes.len(),
            value: service_bytes.as_mut_ptr().cast(),
        };
        let mut name_type_bytes = NT_HOSTBASED_SERVICE;
        let mut name_type = GssOid {
            length: name_type_bytes.len() as OmUint32,
            elements: name_type_bytes.as_mut_ptr().cast(),
        };
        let mut name: GssName = ptr::null_mut();
        // SAFETY: the buffer and OID point at locals that outlive the call.
        let major =
            unsafe { (self.import_name)(&mut minor, &mut name_buffer, &mut name_type, &mut name) };
        if major & ERROR_MASK != 0 {
            return Err(status_message("gss_import_name", major, minor));
        }

        let mut mechanism_bytes = SPNEGO_MECHANISM;
        let mut mechanism = GssOid {
            length: mechanism_bytes.len() as OmUint32,
            elements: mechanism_bytes.as_mut_ptr().cast(),
        };
        let mut context: GssCtx = ptr::null_mut();
        let mut output = GssBuffer {
            length: 0,
            value: ptr::null_mut(),
        };
        // SAFETY: null credential, channel bindings and input token select the
        // GSS-API defaults; `name` was produced by gss_import_name above.
        let major = unsafe {
            (self.init_sec_context)(
                &mut minor,
                ptr::null_mut(),
                &mut context,
                name,
                &mut mechanism,
                MUTUAL_FLAG,
                0,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                &mut output,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        let token = if major & ERROR_MASK != 0 {
            Err(status_message("gss_init_sec_context", major, minor))
        } else if output.value.is_null() || output.length == 0 {
            Err("gss_init_sec_context produced no token".to_owned())
        } else {
            // SAFETY: the library reports `length` readable bytes at `value`.
            let bytes =
                unsafe { std::slice::from_raw_parts(output.value.cast::<u8>(), output.length) };
            Ok(bytes.to_vec())
        };

        let mut ignored: OmUint32 = 0;
        // SAFETY: each handle was allocated by the library and is released once.
        unsafe {
            (self.release_buffer)(&mut ignored, &mut output);
            if !context.is_null() {
                (self.delete_sec_context)(&mut ignored, &mut context, ptr::null_mut());
            }
            (self.release_name)(&mut ignored, &mut name);
        }
        token
    }
}

fn status_message(call: &str, major: OmUint32, minor: OmUint32) -> String {
    format!("{call} failed (major {major:#010x}, minor {minor})")
}

/// Default token source backed by MIT `libgssapi_krb5`.
///
/// Service tickets are requested with the Kerberos profile of the process
/// (`KRB5_CONFIG`, else the system default); the cache written by `kinit`
/// supplies the ticket-granting ticket.
pub struct GssapiTokenSource {
    library_names: Vec<String>,
    api: OnceLock<Result<GssApi, String>>,
}

impl GssapiTokenSource {
    pub fn new() -> Self {
        Self::with_library_names(LIBRARY_NAMES.iter().copied())
    }

    /// Tries each library name in turn on first use.
    pub fn with_library_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            library_names: names.into_iter().map(Into::into).collect(),
            api: OnceLock::new(),
        }
    }

    fn api(&self) -> Result<&GssApi, String> {
        self.api
            .get_or_init(|| {
                let loaded = GssApi::load(&self.library_names);
                if let Err(error) = &loaded {
                    debug!(error = %error, "gss-api unavailable");
                }
                loaded
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

impl Default for GssapiTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GssapiTokenSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GssapiTokenSource")
            .field("library_names", &self.library_names)
            .field("loaded", &self.api.get().map(Result::is_ok))
            .finish()
    }
}

impl NegotiateTokenSource for GssapiTokenSource {
    fn initial_token(&self, ccache: &str, service: &str) -> Result<Vec<u8>, String> {
        self.api()?.initial_token(ccache, service)
    }
}

#[cfg(test)]
mod tests {
    use super::{GssapiTokenSource, NegotiateTokenSource};

    #[test]
    fn missing_library_is_reported_not_fatal() {
        let source = GssapiTokenSource::with_library_names(["/nonexistent/libgssapi_krb5.so.2"]);
        let error = source
            .initial_token("FILE:/tmp/none", "HTTP@artifacts.example.com")
            .expect_err("library missing");
        assert!(error.contains("failed to load GSS-API"), "{error}");

        // The failed load is remembered.
        assert!(source.initial_token("FILE:/tmp/none", "HTTP@a").is_err());
        assert!(format!("{source:?}").contains("loaded: Some(false)"));
    }

    #[test]
    fn no_candidates_means_unsupported() {
        let source = GssapiTokenSource::with_library_names(Vec::<String>::new());
        let error = source
            .initial_token("FILE:/tmp/none", "HTTP@artifacts.example.com")
            .expect_err("no library names");
        assert!(error.contains("this platform"), "{error}");
    }
}
