//! Whole-file POSIX write lock, used to serialize space-map growth.
//!
//! Open-file-description locks (`F_OFD_SETLKW`) rather than classic
//! process-owned `F_SETLKW` records: growth must be serialized between
//! threads of one process just as much as between processes, and OFD lock
//! ownership follows the open file description, so two sessions conflict
//! correctly wherever they live.  The guard unlocks on drop, so every exit
//! path of the resize routine releases the lock.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

/// Exclusive whole-file write lock held for the guard's lifetime.
pub struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    /// Block until the whole-file write lock is acquired.
    pub fn exclusive(file: &'a File) -> io::Result<Self> {
        fcntl_lock(file, libc::F_WRLCK as libc::c_short, true)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // Unlock failure leaves the lock to die with the file description.
        let _ = fcntl_lock(self.file, libc::F_UNLCK as libc::c_short, false);
    }
}

fn fcntl_lock(file: &File, l_type: libc::c_short, wait: bool) -> io::Result<()> {
    let fl = libc::flock {
        l_type,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0, // 0 = to EOF, i.e. the whole file
        l_pid: 0, // required to be 0 for OFD locks
    };
    let cmd = if wait { libc::F_OFD_SETLKW } else { libc::F_OFD_SETLK };

    // SAFETY: `file` is an open descriptor for the guard's lifetime and
    // `fl` is a fully initialized flock record.
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let _guard = FileLock::exclusive(tmp.as_file()).unwrap();
        }
        // Released on drop; a second acquisition must not block.
        let _guard = FileLock::exclusive(tmp.as_file()).unwrap();
    }

    #[test]
    fn separate_descriptions_conflict() {
        use std::sync::mpsc;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_owned();
        let guard = FileLock::exclusive(tmp.as_file()).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap();
            tx.send(()).unwrap();
            // Blocks until the main thread drops its guard.
            let _guard = FileLock::exclusive(&file).unwrap();
        });

        rx.recv().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(guard);
        handle.join().unwrap();
    }
}
