use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{self, c_int, c_void};

use super::commom::AsInner;

/// An owned raw file descriptor, closed exactly once on drop.
#[derive(Debug)]
pub struct FileDesc(RawFd);

impl FileDesc {
    pub fn new(fd: RawFd) -> FileDesc {
        FileDesc(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    pub fn into_raw(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }

    pub fn duplicate(&self) -> io::Result<FileDesc> {
        let fd = syscall!(fcntl(self.0, libc::F_DUPFD_CLOEXEC, 0))?;
        Ok(FileDesc(fd))
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        syscall!(ioctl(self.0, libc::FIOCLEX))?;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut flag = nonblocking as libc::c_int;
        syscall!(ioctl(self.0, libc::FIONBIO, &mut flag))?;
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(self.0, buf.as_mut_ptr() as *mut c_void, buf.len()))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(self.0, buf.as_ptr() as *const c_void, buf.len()))?;
        Ok(n as usize)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let n = syscall!(readv(
            self.0,
            bufs.as_ptr() as *const libc::iovec,
            std::cmp::min(bufs.len(), libc::c_int::MAX as usize) as libc::c_int
        ))?;
        Ok(n as usize)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let n = syscall!(writev(
            self.0,
            bufs.as_ptr() as *const libc::iovec,
            std::cmp::min(bufs.len(), libc::c_int::MAX as usize) as libc::c_int
        ))?;
        Ok(n as usize)
    }
}

impl AsInner<c_int> for FileDesc {
    fn as_inner(&self) -> &c_int {
        &self.0
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileDesc::read(self, buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileDesc::read(self, buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileDesc::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileDesc::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(fd)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw()
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.0);
        }
    }
}
