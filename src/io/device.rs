//! Raw access to the device or image file under scan.
//!
//! Workers read concurrently, so the trait takes `&self`; `DeviceIo` is
//! backed by pread/pwrite on a single fd, `MemDev` by a locked byte
//! vector for tests.

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;

use aligned_vec::{AVec, ConstAlign};

/// Alignment required for O_DIRECT I/O (512 bytes covers all common block
/// devices). Header sectors and filesystem blocks are never smaller.
pub const IO_ALIGN: usize = 512;

pub type AlignedBuf = AVec<u8, ConstAlign<IO_ALIGN>>;

/// Create a new aligned buffer of `size` bytes, zeroed.
pub fn alloc_aligned(size: usize) -> AlignedBuf {
    AVec::from_iter(IO_ALIGN, std::iter::repeat_n(0u8, size))
}

/// A block device or image file. Offsets and lengths are in bytes and
/// must be multiples of [`IO_ALIGN`].
pub trait BlockDev: Sync {
    fn size(&self) -> u64;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
fn open_flags(read_only: bool) -> libc::c_int {
    let access = if read_only { libc::O_RDONLY } else { libc::O_RDWR };
    access | libc::O_DIRECT
}

#[cfg(not(target_os = "linux"))]
fn open_flags(read_only: bool) -> libc::c_int {
    if read_only { libc::O_RDONLY } else { libc::O_RDWR }
}

#[cfg(target_os = "macos")]
fn configure_direct_io(fd: RawFd) -> io::Result<()> {
    // No O_DIRECT on macOS; F_NOCACHE disables the buffer cache instead.
    let ret = unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn configure_direct_io(_fd: RawFd) -> io::Result<()> {
    Ok(())
}

/// Direct-I/O device handle. All access goes through pread/pwrite, so
/// one handle serves every worker.
pub struct DeviceIo {
    fd: RawFd,
    size: u64,
}

impl DeviceIo {
    pub fn open(path: &str, read_only: bool) -> io::Result<Self> {
        let c_path = CString::new(path)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), open_flags(read_only)) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = configure_direct_io(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if size < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Ok(DeviceIo {
            fd,
            size: size as u64,
        })
    }
}

impl BlockDev for DeviceIo {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut total = 0usize;
        while total < buf.len() {
            let ret = unsafe {
                libc::pread(
                    self.fd,
                    buf[total..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - total,
                    (offset + total as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if ret == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of device",
                ));
            }
            total += ret as usize;
        }
        Ok(())
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<()> {
        let mut total = 0usize;
        while total < data.len() {
            let ret = unsafe {
                libc::pwrite(
                    self.fd,
                    data[total..].as_ptr() as *const libc::c_void,
                    data.len() - total,
                    (offset + total as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if ret == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write past end of device",
                ));
            }
            total += ret as usize;
        }
        Ok(())
    }
}

impl Drop for DeviceIo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// In-memory device for tests and synthetic images.
pub struct MemDev {
    data: Mutex<Vec<u8>>,
}

impl MemDev {
    pub fn new(data: Vec<u8>) -> Self {
        MemDev {
            data: Mutex::new(data),
        }
    }

    /// Snapshot of the current image contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().expect("mem device lock poisoned").clone()
    }
}

impl BlockDev for MemDev {
    fn size(&self) -> u64 {
        self.data.lock().expect("mem device lock poisoned").len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.lock().expect("mem device lock poisoned");
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of image"))?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, src: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock().expect("mem device lock poisoned");
        let start = offset as usize;
        let end = start
            .checked_add(src.len())
            .filter(|&e| e <= data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::WriteZero, "write past end of image"))?;
        data[start..end].copy_from_slice(src);
        Ok(())
    }
}
