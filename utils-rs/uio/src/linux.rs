use std::error::Error;
use std::fmt;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::prelude::*;
use std::num::ParseIntError;
use std::os::unix::prelude::AsRawFd;
use std::time::Duration;

use fs2::FileExt;
use nix::sys::mman::{MapFlags, ProtFlags};
use timeout_readwrite::TimeoutReader;

const PAGESIZE: usize = 4096;

/// Upper bound on the /dev/uioN namespace scanned by `open_by_name`
const MAX_UIO_DEVICES: usize = 32;

#[derive(Debug)]
pub enum UioError {
    Io(io::Error),
    Map(nix::Error),
    Parse,
}

impl From<io::Error> for UioError {
    fn from(e: io::Error) -> Self {
        UioError::Io(e)
    }
}

impl From<ParseIntError> for UioError {
    fn from(_: ParseIntError) -> Self {
        UioError::Parse
    }
}

impl From<nix::Error> for UioError {
    fn from(e: nix::Error) -> Self {
        UioError::Map(e)
    }
}

impl fmt::Display for UioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UioError::Parse => write!(f, "integer conversion error"),
            UioError::Io(ref e) => write!(f, "{}", e),
            UioError::Map(ref e) => write!(f, "{}", e),
        }
    }
}

impl Error for UioError {
    fn cause(&self) -> Option<&dyn Error> {
        match self {
            UioError::Io(ref e) => Some(e),
            UioError::Map(ref e) => Some(e),
            UioError::Parse => None,
        }
    }
}

/// This structure represents memory mapping as performed by `mmap()` syscall.
/// Lifetime of this structure is directly tied to the mapping and once the
/// structure goes out of the scope, the mapping is `munmap()`-ed.
///
/// The inner pointer `ptr` is public, but the responsibility to not use it
/// after the UioMapping structure has gone out of scope is on the caller.
///
/// The mapping also holds the exclusive advisory lock on the UIO device file
/// so that two processes (or two mappings within one process) cannot drive
/// the same register block at once. The lock is dropped together with the
/// mapping.
pub struct UioMapping {
    pub ptr: *mut libc::c_void,
    length: usize,
    lock: File,
}

impl Drop for UioMapping {
    fn drop(&mut self) {
        unsafe { nix::sys::mman::munmap(self.ptr, self.length) }.expect("munmap is successful");
        let _ = self.lock.unlock();
    }
}

pub struct UioDevice {
    uio_num: usize,
    devfile: File,
}

impl UioDevice {
    /// Creates a new UIO device for Linux.
    ///
    /// # Arguments
    ///  * uio_num - UIO index of device (i.e., 1 for /dev/uio1)
    pub fn new(uio_num: usize) -> io::Result<UioDevice> {
        let path = format!("/dev/uio{}", uio_num);
        let devfile = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(UioDevice { uio_num, devfile })
    }

    /// Go through all UIO devices in /sys and try to find one with
    /// matching name.
    ///
    /// # Arguments
    ///  * uio_name - name of the uio device (must match the one in sysfs)
    pub fn open_by_name(uio_name: &str) -> io::Result<UioDevice> {
        for i in 0..MAX_UIO_DEVICES {
            let path = format!("/sys/class/uio/uio{}/name", i);
            let name = match fs::read_to_string(path) {
                Ok(name) => name,
                // no more devices registered
                Err(_) => break,
            };
            if name.trim() == uio_name {
                return UioDevice::new(i);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no uio device named {:?}", uio_name),
        ))
    }

    fn read_file(&self, path: String) -> Result<String, UioError> {
        let mut file = File::open(path)?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)?;
        Ok(buffer.trim().to_string())
    }

    /// The amount of events.
    pub fn get_event_count(&self) -> Result<u32, UioError> {
        let filename = format!("/sys/class/uio/uio{}/event", self.uio_num);
        let buffer = self.read_file(filename)?;
        match u32::from_str_radix(&buffer, 10) {
            Ok(v) => Ok(v),
            Err(e) => Err(UioError::from(e)),
        }
    }

    /// The name of the UIO device.
    pub fn get_name(&self) -> Result<String, UioError> {
        let filename = format!("/sys/class/uio/uio{}/name", self.uio_num);
        self.read_file(filename)
    }

    /// The size of a given mapping.
    ///
    /// # Arguments
    ///  * mapping: The given index of the mapping (i.e., 1 for /sys/class/uio/uioX/maps/map1)
    pub fn map_size(&self, mapping: usize) -> Result<usize, UioError> {
        let filename = format!(
            "/sys/class/uio/uio{}/maps/map{}/size",
            self.uio_num, mapping
        );
        let buffer = self.read_file(filename)?;
        match usize::from_str_radix(&buffer[2..], 16) {
            Ok(v) => Ok(v),
            Err(e) => Err(UioError::from(e)),
        }
    }

    /// Map an available memory mapping.
    ///
    /// Returns UioMapping structure, which represents the mapping. Lifetime
    /// of the structure is directly tied to the mapping. The UIO device file
    /// is exclusively locked for as long as the mapping lives.
    ///
    /// # Arguments
    ///  * mapping: The given index of the mapping (i.e., 1 for /sys/class/uio/uioX/maps/map1)
    pub fn map_mapping(&self, mapping: usize) -> Result<UioMapping, UioError> {
        let offset = mapping * PAGESIZE;
        let map_size = self.map_size(mapping)?;

        let lock = self.devfile.try_clone()?;
        lock.try_lock_exclusive()?;

        let res = unsafe {
            nix::sys::mman::mmap(
                0 as *mut libc::c_void,
                map_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.devfile.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        match res {
            Ok(m) => Ok(UioMapping {
                ptr: m,
                length: map_size,
                lock,
            }),
            Err(e) => {
                let _ = lock.unlock();
                Err(UioError::from(e))
            }
        }
    }

    /// Enable interrupt
    pub fn irq_enable(&self) -> io::Result<()> {
        let bytes = 1u32.to_ne_bytes();
        self.devfile.try_clone()?.write(&bytes)?;
        Ok(())
    }

    /// Disable interrupt
    pub fn irq_disable(&self) -> io::Result<()> {
        let bytes = 0u32.to_ne_bytes();
        self.devfile.try_clone()?.write(&bytes)?;
        Ok(())
    }

    /// Wait for interrupt, returns the interrupt count read from the descriptor
    pub fn irq_wait(&self) -> io::Result<u32> {
        let mut bytes = [0u8; 4];
        self.devfile.try_clone()?.read(&mut bytes)?;
        Ok(u32::from_ne_bytes(bytes))
    }

    /// Wait for interrupt with timeout.
    /// Returns `None` on timeout, which is not an error condition.
    pub fn irq_wait_timeout(&self, timeout: Duration) -> io::Result<Option<u32>> {
        let mut rdr = TimeoutReader::new(self.devfile.try_clone()?, timeout);
        let mut bytes = [0u8; 4];
        let res = rdr.read_exact(&mut bytes);

        if let Err(e) = res {
            if e.kind() == io::ErrorKind::TimedOut {
                Ok(None)
            } else {
                Err(e)
            }
        } else {
            Ok(Some(u32::from_ne_bytes(bytes)))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    /// Needs a registered /dev/uio0
    #[test]
    #[ignore]
    fn open() {
        let res = UioDevice::new(0);
        match res {
            Err(e) => {
                panic!("Can not open device /dev/uio0: {}", e);
            }
            Ok(_f) => (),
        }
    }

    #[test]
    fn open_by_name_notfound() {
        let res = UioDevice::open_by_name("total-nonsense-device");
        assert!(res.is_err(), "found a uio device that cannot exist");
    }

    /// Needs a registered /dev/uio0
    #[test]
    #[ignore]
    fn print_info() {
        let res = UioDevice::new(0).unwrap();
        let name = res.get_name().expect("Can't get name");
        let event_count = res.get_event_count().expect("Can't get event count");
        assert!(!name.is_empty());
        assert_eq!(event_count, 0);
    }

    /// Needs a registered /dev/uio0
    #[test]
    #[ignore]
    fn map() {
        let res = UioDevice::new(0).unwrap();
        let mapping = res.map_mapping(0);
        match mapping {
            Err(e) => {
                panic!("Can not map uio mapping: {:?}", e);
            }
            Ok(_f) => (),
        }
    }
}
