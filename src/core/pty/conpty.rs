//! ConPTY backend for Windows

use std::io::{self, Read, Write};

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, ERROR_BROKEN_PIPE, HANDLE};
use windows::Win32::Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile};
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, InitializeProcThreadAttributeList,
    UpdateProcThreadAttribute, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, STARTUPINFOEXW,
};

use super::{LaunchCommand, Pty, PtyError, Result};
use crate::config::Environment;
use crate::core::term::TerminalSize;

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

fn coord(size: TerminalSize) -> COORD {
    COORD {
        X: size.columns().min(i16::MAX as u16) as i16,
        Y: size.rows().min(i16::MAX as u16) as i16,
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// `NAME=value\0...\0\0`, as CreateProcessW expects with
/// CREATE_UNICODE_ENVIRONMENT
fn environment_block(env: &Environment) -> Vec<u16> {
    let mut block = Vec::new();
    for (name, value) in env.iter() {
        block.extend(format!("{}={}", name, value).encode_utf16());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Handle closed on drop
struct OwnedHandle(HANDLE);

// Safety: pipe handles may be used from any thread
unsafe impl Send for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct PipeReader(OwnedHandle);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read: u32 = 0;
        let result = unsafe { ReadFile(self.0 .0, Some(buf), Some(&mut read), None) };
        match result {
            Ok(()) => Ok(read as usize),
            // The pseudo console closed its end
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

struct PipeWriter(OwnedHandle);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written: u32 = 0;
        unsafe {
            WriteFile(self.0 .0, Some(buf), Some(&mut written), None).map_err(io::Error::from)?;
        }
        Ok(written as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        unsafe { FlushFileBuffers(self.0 .0).map_err(io::Error::from) }
    }
}

/// ConPTY handle wrapper
pub struct ConPty {
    hpc: Option<HPCON>,
    reader: Option<PipeReader>,
    writer: Option<PipeWriter>,
    process: PROCESS_INFORMATION,
}

// Safety: ConPty handles are thread-safe when accessed properly
unsafe impl Send for ConPty {}

impl ConPty {
    pub fn spawn(size: TerminalSize, launch: &LaunchCommand) -> Result<Self> {
        unsafe { Self::create_internal(size, launch) }
    }

    unsafe fn create_internal(size: TerminalSize, launch: &LaunchCommand) -> Result<Self> {
        // Input pipe (we write, PTY reads)
        let mut pty_input_read = HANDLE::default();
        let mut pty_input_write = HANDLE::default();
        CreatePipe(&mut pty_input_read, &mut pty_input_write, None, 0)
            .map_err(|e| PtyError::Creation(e.into()))?;
        let input_read = OwnedHandle(pty_input_read);
        let writer = PipeWriter(OwnedHandle(pty_input_write));

        // Output pipe (PTY writes, we read)
        let mut pty_output_read = HANDLE::default();
        let mut pty_output_write = HANDLE::default();
        CreatePipe(&mut pty_output_read, &mut pty_output_write, None, 0)
            .map_err(|e| PtyError::Creation(e.into()))?;
        let reader = PipeReader(OwnedHandle(pty_output_read));
        let output_write = OwnedHandle(pty_output_write);

        let hpc = CreatePseudoConsole(coord(size), input_read.0, output_write.0, 0)
            .map_err(|e| PtyError::Creation(e.into()))?;

        // The pseudo console duplicated these
        drop(input_read);
        drop(output_write);

        match Self::start_process(hpc, launch) {
            Ok(process) => Ok(ConPty {
                hpc: Some(hpc),
                reader: Some(reader),
                writer: Some(writer),
                process,
            }),
            Err(e) => {
                ClosePseudoConsole(hpc);
                Err(e)
            }
        }
    }

    unsafe fn start_process(hpc: HPCON, launch: &LaunchCommand) -> Result<PROCESS_INFORMATION> {
        let spawn_error = |e: windows::core::Error| PtyError::ProcessSpawn(e.into());

        let mut attr_list_size: usize = 0;
        let _ = InitializeProcThreadAttributeList(
            LPPROC_THREAD_ATTRIBUTE_LIST::default(),
            1,
            0,
            &mut attr_list_size,
        );

        let mut attr_list_buffer = vec![0u8; attr_list_size];
        let attr_list = LPPROC_THREAD_ATTRIBUTE_LIST(attr_list_buffer.as_mut_ptr() as *mut _);

        InitializeProcThreadAttributeList(attr_list, 1, 0, &mut attr_list_size)
            .map_err(spawn_error)?;

        // Associate ConPTY with the process
        let result = UpdateProcThreadAttribute(
            attr_list,
            0,
            PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
            Some(hpc.0 as *const _),
            std::mem::size_of::<HPCON>(),
            None,
            None,
        );
        if let Err(e) = result {
            DeleteProcThreadAttributeList(attr_list);
            return Err(spawn_error(e));
        }

        let mut startup_info = STARTUPINFOEXW {
            StartupInfo: std::mem::zeroed(),
            lpAttributeList: attr_list,
        };
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

        let mut cmd_wide = wide(&launch.command_line());
        let env_block = environment_block(&launch.environment);
        let cwd_wide = launch
            .working_directory
            .as_ref()
            .map(|cwd| wide(&cwd.to_string_lossy()));
        let cwd = cwd_wide
            .as_ref()
            .map_or(PCWSTR::null(), |cwd| PCWSTR(cwd.as_ptr()));

        let mut process_info = PROCESS_INFORMATION::default();
        let result = CreateProcessW(
            PCWSTR::null(),
            PWSTR(cmd_wide.as_mut_ptr()),
            None,
            None,
            false,
            EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
            Some(env_block.as_ptr() as *const _),
            cwd,
            &startup_info.StartupInfo,
            &mut process_info,
        );

        DeleteProcThreadAttributeList(attr_list);
        result.map_err(spawn_error)?;
        Ok(process_info)
    }
}

impl Pty for ConPty {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        match self.reader.take() {
            Some(reader) => Ok(Box::new(reader)),
            None => Err(PtyError::AlreadyTaken("reader")),
        }
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>> {
        match self.writer.take() {
            Some(writer) => Ok(Box::new(writer)),
            None => Err(PtyError::AlreadyTaken("writer")),
        }
    }

    fn resize(&mut self, size: TerminalSize) -> Result<()> {
        let hpc = self.hpc.ok_or(PtyError::Closed)?;
        unsafe { ResizePseudoConsole(hpc, coord(size)).map_err(|e| PtyError::Resize(e.into())) }
    }

    fn close(&mut self) {
        if let Some(hpc) = self.hpc.take() {
            // Terminates the attached clients and breaks the output pipe
            unsafe { ClosePseudoConsole(hpc) };
        }
    }
}

impl Drop for ConPty {
    fn drop(&mut self) {
        self.close();
        unsafe {
            let _ = CloseHandle(self.process.hProcess);
            let _ = CloseHandle(self.process.hThread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_block_layout() {
        let env: Environment = [("A", "1"), ("B", "2")].into_iter().collect();
        let block = environment_block(&env);
        let text = String::from_utf16(&block).unwrap();
        assert_eq!(text, "A=1\0B=2\0\0");
        assert_eq!(environment_block(&Environment::new()), vec![0, 0]);
    }

    #[test]
    fn test_conpty_creation() {
        let launch = LaunchCommand {
            program: "cmd.exe /c echo hello".to_string(),
            arguments: Vec::new(),
            working_directory: None,
            environment: Environment::from_os(),
        };
        let mut pty = ConPty::spawn(TerminalSize::new(80, 24), &launch).unwrap();
        assert!(pty.take_reader().is_ok());
        pty.close();
        pty.close();
    }
}
