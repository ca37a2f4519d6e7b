//! Message journal for historical replay.
//!
//! Records are kept in an ordered store under a monotonically increasing
//! 32-bit key, big-endian encoded so that the store's byte order is the
//! key order. Key 0 is reserved and holds the next key to assign.

use std::path::Path;

use crate::Result;

const NEXT_KEY: [u8; 4] = [0, 0, 0, 0];

pub struct Journal {
    db: sled::Db,
}

impl Journal {
    /// Open or create the journal at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::default().path(path).open()?;

        Ok(Self { db })
    }

    /// An in-memory journal, dropped on close.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::default().temporary(true).open()?;

        Ok(Self { db })
    }

    /// The key the next record will be stored under.
    pub fn next_key(&self) -> Result<u32> {
        Ok(self
            .db
            .get(NEXT_KEY)?
            .and_then(|v| v.as_ref().try_into().ok().map(u32::from_be_bytes))
            .unwrap_or(1))
    }

    /// Store a record, returning its key.
    pub fn append(&self, record: &[u8]) -> Result<u32> {
        let key = self.next_key()?;

        self.db.insert(&key.to_be_bytes()[..], record)?;
        self.db
            .insert(&NEXT_KEY[..], &key.wrapping_add(1).to_be_bytes()[..])?;

        Ok(key)
    }

    /// Records with keys in `[low, high)`, oldest first.
    pub fn range(&self, low: u32, high: u32) -> Result<Vec<(u32, Vec<u8>)>> {
        // Key 0 is bookkeeping, never a record.
        let low = low.max(1);
        if low >= high {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in self.db.range(low.to_be_bytes()..high.to_be_bytes()) {
            let (key, value) = entry?;
            let key = key
                .as_ref()
                .try_into()
                .map(u32::from_be_bytes)
                .unwrap_or_default();
            records.push((key, value.to_vec()));
        }

        Ok(records)
    }

    /// Flush outstanding writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_monotonic() {
        let journal = Journal::temporary().unwrap();

        assert_eq!(journal.next_key().unwrap(), 1);
        assert_eq!(journal.append(b"one").unwrap(), 1);
        assert_eq!(journal.append(b"two").unwrap(), 2);
        assert_eq!(journal.append(b"three").unwrap(), 3);
        assert_eq!(journal.next_key().unwrap(), 4);
    }

    #[test]
    fn range_is_half_open() {
        let journal = Journal::temporary().unwrap();
        for record in [&b"a"[..], b"b", b"c", b"d"] {
            journal.append(record).unwrap();
        }

        let records = journal.range(2, 4).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (2, b"b".to_vec()));
        assert_eq!(records[1], (3, b"c".to_vec()));

        assert!(journal.range(3, 3).unwrap().is_empty());
    }

    #[test]
    fn range_skips_the_reserved_key() {
        let journal = Journal::temporary().unwrap();
        journal.append(b"a").unwrap();

        let records = journal.range(0, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 1);
    }
}
