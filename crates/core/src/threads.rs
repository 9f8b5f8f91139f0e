//! Thread control: enumeration, suspend/resume, and instruction-pointer
//! read/write for every other thread in the process, plus a scoped
//! "all other threads paused" region used while patching live code.

use crate::error::{HookError, HookResult};

/// A suspended thread, owning the OS handle until dropped.
#[cfg(windows)]
pub struct SuspendedThread {
    tid: u32,
    handle: windows::Win32::Foundation::HANDLE,
}

#[cfg(windows)]
impl SuspendedThread {
    /// Opens and suspends the thread identified by `tid`.
    fn suspend(tid: u32) -> HookResult<Self> {
        use windows::Win32::System::Threading::{
            OpenThread, SuspendThread, THREAD_GET_CONTEXT, THREAD_SET_CONTEXT,
            THREAD_SUSPEND_RESUME,
        };

        let handle = unsafe {
            OpenThread(
                THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT,
                false,
                tid,
            )
        }
        .map_err(|e| HookError::ThreadControlFailure(format!("OpenThread({tid}): {e:?}")))?;

        let result = unsafe { SuspendThread(handle) };
        if result == u32::MAX {
            return Err(HookError::ThreadControlFailure(format!(
                "SuspendThread({tid}) failed"
            )));
        }

        Ok(Self { tid, handle })
    }

    /// The thread id this handle refers to.
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Reads the thread's current instruction pointer: `Rip` on 64-bit,
    /// `Eip` on 32-bit (the two `CONTEXT` layouts the `windows` crate
    /// exposes per target are otherwise unrelated structs).
    pub fn instruction_pointer(&self) -> HookResult<usize> {
        use windows::Win32::System::Diagnostics::Debug::{GetThreadContext, CONTEXT};
        #[cfg(target_pointer_width = "64")]
        use windows::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_AMD64 as CONTEXT_CONTROL;
        #[cfg(target_pointer_width = "32")]
        use windows::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_X86 as CONTEXT_CONTROL;

        let mut ctx = CONTEXT {
            ContextFlags: CONTEXT_CONTROL,
            ..Default::default()
        };
        unsafe { GetThreadContext(self.handle, &mut ctx) }.map_err(|e| {
            HookError::ThreadControlFailure(format!("GetThreadContext({}): {e:?}", self.tid))
        })?;
        #[cfg(target_pointer_width = "64")]
        {
            Ok(ctx.Rip as usize)
        }
        #[cfg(target_pointer_width = "32")]
        {
            Ok(ctx.Eip as usize)
        }
    }

    /// Rewrites the thread's instruction pointer. Used when a thread's IP
    /// is caught inside the overwrite window during an install/remove.
    pub fn set_instruction_pointer(&self, ip: usize) -> HookResult<()> {
        use windows::Win32::System::Diagnostics::Debug::{
            GetThreadContext, SetThreadContext, CONTEXT,
        };
        #[cfg(target_pointer_width = "64")]
        use windows::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_AMD64 as CONTEXT_CONTROL;
        #[cfg(target_pointer_width = "32")]
        use windows::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_X86 as CONTEXT_CONTROL;

        let mut ctx = CONTEXT {
            ContextFlags: CONTEXT_CONTROL,
            ..Default::default()
        };
        unsafe { GetThreadContext(self.handle, &mut ctx) }.map_err(|e| {
            HookError::ThreadControlFailure(format!("GetThreadContext({}): {e:?}", self.tid))
        })?;
        #[cfg(target_pointer_width = "64")]
        {
            ctx.Rip = ip as u64;
        }
        #[cfg(target_pointer_width = "32")]
        {
            ctx.Eip = ip as u32;
        }
        unsafe { SetThreadContext(self.handle, &ctx) }.map_err(|e| {
            HookError::ThreadControlFailure(format!("SetThreadContext({}): {e:?}", self.tid))
        })?;
        Ok(())
    }

    fn resume(&self) {
        use windows::Win32::System::Threading::ResumeThread;
        unsafe {
            ResumeThread(self.handle);
        }
    }
}

#[cfg(windows)]
impl Drop for SuspendedThread {
    fn drop(&mut self) {
        self.resume();
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(self.handle);
        }
    }
}

/// Enumerates every other thread belonging to the current process.
#[cfg(windows)]
fn enumerate_other_thread_ids() -> HookResult<Vec<u32>> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };
    use windows::Win32::System::Threading::{GetCurrentProcessId, GetCurrentThreadId};

    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
        .map_err(|e| HookError::ThreadControlFailure(format!("CreateToolhelp32Snapshot: {e:?}")))?;

    let this_process = unsafe { GetCurrentProcessId() };
    let this_thread = unsafe { GetCurrentThreadId() };

    let mut ids = Vec::new();
    let mut entry = THREADENTRY32 {
        dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
        ..Default::default()
    };

    let mut has_entry = unsafe { Thread32First(snapshot, &mut entry) }.is_ok();
    while has_entry {
        if entry.th32OwnerProcessID == this_process && entry.th32ThreadID != this_thread {
            ids.push(entry.th32ThreadID);
        }
        has_entry = unsafe { Thread32Next(snapshot, &mut entry) }.is_ok();
    }

    unsafe {
        let _ = CloseHandle(snapshot);
    }

    Ok(ids)
}

/// Scoped "all other threads paused" region: on construction, suspends
/// every other thread in the process; on drop, resumes them all. Release
/// is guaranteed on every exit path, including early `?` returns.
#[cfg(windows)]
pub struct PausedThreads {
    threads: Vec<SuspendedThread>,
}

#[cfg(windows)]
impl PausedThreads {
    /// Suspends all threads in the process other than the caller.
    pub fn suspend_all_others() -> HookResult<Self> {
        let ids = enumerate_other_thread_ids()?;
        let mut threads = Vec::with_capacity(ids.len());
        for tid in ids {
            // A thread may have exited between enumeration and suspend;
            // that's not fatal, just skip it.
            if let Ok(suspended) = SuspendedThread::suspend(tid) {
                threads.push(suspended);
            }
        }
        tracing::debug!("suspended {} other thread(s)", threads.len());
        Ok(Self { threads })
    }

    /// Iterates the suspended threads so the caller can rewrite any IP
    /// caught inside an overwrite window.
    pub fn iter(&self) -> impl Iterator<Item = &SuspendedThread> {
        self.threads.iter()
    }
}

/// Scoped priority elevation for the calling thread, shrinking the window
/// during which other threads could be pre-empted mid-patch.
#[cfg(windows)]
pub struct PriorityBoost {
    previous: i32,
}

#[cfg(windows)]
impl PriorityBoost {
    /// Raises the calling thread's priority to time-critical.
    pub fn engage() -> Self {
        use windows::Win32::System::Threading::{
            GetCurrentThread, GetThreadPriority, SetThreadPriority,
            THREAD_PRIORITY_TIME_CRITICAL,
        };
        unsafe {
            let handle = GetCurrentThread();
            let previous = GetThreadPriority(handle);
            let _ = SetThreadPriority(handle, THREAD_PRIORITY_TIME_CRITICAL);
            Self { previous }
        }
    }
}

#[cfg(windows)]
impl Drop for PriorityBoost {
    fn drop(&mut self) {
        use windows::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY,
        };
        unsafe {
            let _ = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY(self.previous));
        }
    }
}

#[cfg(not(windows))]
pub struct PausedThreads;

#[cfg(not(windows))]
impl PausedThreads {
    pub fn suspend_all_others() -> HookResult<Self> {
        Err(HookError::ThreadControlFailure(
            "thread control is only implemented for Windows".into(),
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SuspendedThread> {
        std::iter::empty()
    }
}

#[cfg(not(windows))]
pub struct SuspendedThread;

#[cfg(not(windows))]
impl SuspendedThread {
    pub fn instruction_pointer(&self) -> HookResult<usize> {
        unreachable!("non-Windows PausedThreads never holds a SuspendedThread")
    }

    pub fn set_instruction_pointer(&self, _ip: usize) -> HookResult<()> {
        unreachable!("non-Windows PausedThreads never holds a SuspendedThread")
    }
}

#[cfg(not(windows))]
pub struct PriorityBoost;

#[cfg(not(windows))]
impl PriorityBoost {
    pub fn engage() -> Self {
        Self
    }
}
