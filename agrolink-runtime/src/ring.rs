//! Crash-persistent byte ring for the gateway.
//!
//! The payload lives in a file, mapped twice back to back so that any
//! window of up to the ring size reads as one contiguous slice regardless
//! of where it wraps. Two trailer words after the payload persist the head
//! and tail offsets; a reopen resumes where the writer left off, with
//! readers synced to live traffic.
//!
//! Offsets are absolute byte counts since the ring was created, reduced
//! modulo the ring size only when touching memory. That keeps the full/
//! empty distinction exact: the ring holds `tail - head` bytes, never more
//! than its size.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    os::unix::io::AsRawFd,
    path::Path,
    sync::{Condvar, Mutex, MutexGuard},
};

const TRAILER_LEN: u64 = 16;

/// Smallest supported ring order; one page.
pub const MIN_ORDER: u32 = 12;

pub struct RingLog {
    file: File,
    address: *mut u8,
    size: usize,
    head: u64,
    start: u64,
    curs: u64,
    tail: u64,
}

// The mapping is owned exclusively by this value.
unsafe impl Send for RingLog {}

impl RingLog {
    /// Open or create a ring of `2^order` bytes backed by `path`.
    ///
    /// An existing file resumes from its persisted offsets; the read
    /// cursors start at the tail, so only traffic appended after the reopen
    /// is unread.
    pub fn open<P: AsRef<Path>>(path: P, order: u32) -> io::Result<Self> {
        if !(MIN_ORDER..63).contains(&order) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring order out of range",
            ));
        }

        let size = 1usize << order;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size as u64 + TRAILER_LEN)?;

        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.read_exact_at(&mut trailer, size as u64)?;
        let mut head = u64::from_le_bytes(trailer[..8].try_into().unwrap());
        let tail = u64::from_le_bytes(trailer[8..].try_into().unwrap());

        // A torn trailer write leaves head and tail out of step; resync to
        // an empty ring at the persisted tail.
        if head > tail || tail - head > size as u64 {
            head = tail;
        }

        let address = unsafe { map_twice(&file, size)? };

        Ok(Self {
            file,
            address,
            size,
            head,
            start: tail,
            curs: tail,
            tail,
        })
    }

    /// Ring capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn head(&self) -> u64 {
        self.head
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn curs(&self) -> u64 {
        self.curs
    }

    #[inline]
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Bytes retained between head and tail.
    #[inline]
    pub fn filled_bytes(&self) -> usize {
        (self.tail - self.head) as usize
    }

    /// Bytes between the read cursor and the tail.
    #[inline]
    pub fn unread_bytes(&self) -> usize {
        (self.tail - self.curs) as usize
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.size - self.filled_bytes()
    }

    fn window(&self, from: u64, len: usize) -> &[u8] {
        let offset = (from & (self.size as u64 - 1)) as usize;

        unsafe { std::slice::from_raw_parts(self.address.add(offset), len) }
    }

    /// The unread bytes as one contiguous slice.
    pub fn unread(&self) -> &[u8] {
        self.window(self.curs, self.unread_bytes())
    }

    /// Every retained byte, oldest first.
    pub fn retained(&self) -> &[u8] {
        self.window(self.head, self.filled_bytes())
    }

    /// Append bytes, overwriting the oldest data when full.
    ///
    /// The tail (and the head, when data was overwritten) is persisted to
    /// the trailer before returning. A failed trailer write leaves the
    /// in-memory ring consistent; the next successful append repairs the
    /// file.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "append larger than the ring",
            ));
        }

        let offset = (self.tail & (self.size as u64 - 1)) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.address.add(offset), bytes.len());
        }

        self.tail += bytes.len() as u64;
        if self.tail - self.head > self.size as u64 {
            self.head = self.tail - self.size as u64;
        }
        self.start = self.start.max(self.head);
        self.curs = self.curs.max(self.head);

        self.write_trailer()
    }

    /// Advance the read cursor, capped at the tail.
    pub fn read_advance(&mut self, count: usize) {
        self.curs = (self.curs + count as u64).min(self.tail);
    }

    /// Advance the retention marker, capped at the tail.
    pub fn start_advance(&mut self, count: usize) {
        self.start = (self.start + count as u64).min(self.tail);
        self.curs = self.curs.max(self.start);
    }

    /// Discard the oldest bytes, dragging the other cursors along.
    pub fn head_advance(&mut self, count: usize) -> io::Result<()> {
        self.head = (self.head + count as u64).min(self.tail);
        self.start = self.start.max(self.head);
        self.curs = self.curs.max(self.head);

        self.write_trailer()
    }

    pub fn seek_curs_head(&mut self) {
        self.curs = self.head;
    }

    pub fn seek_curs_start(&mut self) {
        self.curs = self.start;
    }

    pub fn seek_curs_tail(&mut self) {
        self.curs = self.tail;
    }

    /// Drop everything and persist an empty ring.
    pub fn clear(&mut self) -> io::Result<()> {
        self.head = 0;
        self.start = 0;
        self.curs = 0;
        self.tail = 0;

        self.write_trailer()
    }

    fn write_trailer(&self) -> io::Result<()> {
        let mut trailer = [0u8; TRAILER_LEN as usize];
        trailer[..8].copy_from_slice(&self.head.to_le_bytes());
        trailer[8..].copy_from_slice(&self.tail.to_le_bytes());

        self.file.write_all_at(&trailer, self.size as u64)
    }
}

impl Drop for RingLog {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.address as *mut libc::c_void, self.size << 1);
        }
    }
}

/// Reserve twice the ring size of address space, then map the file into
/// both halves. Reads crossing the ring boundary continue seamlessly into
/// the second mapping.
unsafe fn map_twice(file: &File, size: usize) -> io::Result<*mut u8> {
    let reservation = libc::mmap(
        std::ptr::null_mut(),
        size << 1,
        libc::PROT_NONE,
        libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
        -1,
        0,
    );
    if reservation == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    for half in 0..2 {
        let address = libc::mmap(
            reservation.add(half * size),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );
        if address == libc::MAP_FAILED || address != reservation.add(half * size) {
            let e = io::Error::last_os_error();
            libc::munmap(reservation, size << 1);
            return Err(e);
        }
    }

    Ok(reservation as *mut u8)
}

/// A ring shared between threads.
///
/// The bare [`RingLog`] is for a single event loop that drives both the
/// writer and the reader; this wrapper adds a lock and a condition for the
/// multi-threaded arrangement, where a reader parks in
/// [`SharedRingLog::wait_unread`] until a writer appends.
pub struct SharedRingLog {
    inner: Mutex<RingLog>,
    unread: Condvar,
}

impl SharedRingLog {
    pub fn new(log: RingLog) -> Self {
        Self {
            inner: Mutex::new(log),
            unread: Condvar::new(),
        }
    }

    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let result = self.inner.lock().unwrap().append(bytes);
        self.unread.notify_all();
        result
    }

    /// Block until unread bytes are available, returning the locked ring.
    pub fn wait_unread(&self) -> MutexGuard<'_, RingLog> {
        let mut guard = self.inner.lock().unwrap();
        while guard.unread_bytes() == 0 {
            guard = self.unread.wait(guard).unwrap();
        }

        guard
    }

    /// Run `f` on the locked ring.
    pub fn with<R>(&self, f: impl FnOnce(&mut RingLog) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        let result = f(&mut guard);
        self.unread.notify_all();
        result
    }
}
