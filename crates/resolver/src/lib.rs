//! Symbol resolver: the external collaborator named in §6 — maps a
//! symbol name, plus an optional module hint, to an address by walking
//! loaded modules' export tables. Consumed by `detour-ffi`'s
//! `create_by_name`, never by `detour-core` directly (the core only ever
//! takes resolved addresses).

use thiserror::Error;

/// Errors resolving a symbol name to an address.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// `module_hint` did not name a loaded module.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// The symbol was not found in the searched module(s).
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// The underlying OS call failed.
    #[error("symbol resolution failed: {0}")]
    Os(String),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Resolves `symbol` to an address.
///
/// If `module_hint` is `Some`, only that module's export table is
/// searched. If `None`, every module loaded in the current process is
/// searched, in load order, returning the first match.
#[cfg(windows)]
pub fn resolve(symbol: &str, module_hint: Option<&str>) -> ResolveResult<usize> {
    match module_hint {
        Some(module) => resolve_in_module(module, symbol),
        None => resolve_in_any_loaded_module(symbol),
    }
}

#[cfg(windows)]
fn resolve_in_module(module: &str, symbol: &str) -> ResolveResult<usize> {
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::core::{HSTRING, PCSTR};

    let wide = HSTRING::from(module);
    let handle = unsafe { GetModuleHandleW(&wide) }
        .map_err(|_| ResolveError::ModuleNotFound(module.to_string()))?;

    let symbol_cstr = std::ffi::CString::new(symbol)
        .map_err(|_| ResolveError::SymbolNotFound(symbol.to_string()))?;
    let address = unsafe {
        windows::Win32::System::LibraryLoader::GetProcAddress(
            handle,
            PCSTR(symbol_cstr.as_ptr() as *const u8),
        )
    };

    match address {
        Some(proc) => Ok(proc as usize),
        None => Err(ResolveError::SymbolNotFound(symbol.to_string())),
    }
}

#[cfg(windows)]
fn resolve_in_any_loaded_module(symbol: &str) -> ResolveResult<usize> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
        TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
    };
    use windows::Win32::System::Threading::GetCurrentProcessId;

    let pid = unsafe { GetCurrentProcessId() };
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }
        .map_err(|e| ResolveError::Os(format!("CreateToolhelp32Snapshot: {e:?}")))?;

    let mut entry = MODULEENTRY32W {
        dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
        ..Default::default()
    };

    let mut has_entry = unsafe { Module32FirstW(snapshot, &mut entry) }.is_ok();
    let mut found = None;
    while has_entry {
        let name_len = entry.szModule.iter().position(|&c| c == 0).unwrap_or(entry.szModule.len());
        let name = String::from_utf16_lossy(&entry.szModule[..name_len]);

        if let Ok(address) = resolve_in_module(&name, symbol) {
            found = Some(address);
            break;
        }

        has_entry = unsafe { Module32NextW(snapshot, &mut entry) }.is_ok();
    }

    unsafe {
        let _ = CloseHandle(snapshot);
    }

    found.ok_or_else(|| ResolveError::SymbolNotFound(symbol.to_string()))
}

#[cfg(not(windows))]
pub fn resolve(symbol: &str, _module_hint: Option<&str>) -> ResolveResult<usize> {
    Err(ResolveError::Os(format!(
        "symbol resolution is only implemented for Windows (looking up {symbol:?})"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(windows)]
    fn resolves_a_known_export_from_kernel32() {
        let address = resolve("Sleep", Some("kernel32.dll"));
        assert!(address.is_ok());
    }

    #[test]
    fn reports_missing_symbol() {
        let err = resolve("ThisSymbolDoesNotExist12345", Some("kernel32.dll"));
        assert!(err.is_err());
    }
}
