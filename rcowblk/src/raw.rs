// SPDX-License-Identifier: MIT

//! Raw file driver: a thin [`BlockNode`] over one host file. Block status,
//! write-zeroes and discard are intentionally absent and advertised as not
//! supported; the generic layer supplies fallbacks where they exist.

use std::sync::Arc;

use rcowio::{FileBackend, IoVec, IoVecMut, OpenMode};

use crate::error::{BlockError, BlockResult};
use crate::flags::{OpenFlags, ReqFlags};
use crate::node::{BdsCommon, BlockNode};

pub struct Raw {
    common: BdsCommon,
    file: FileBackend,
}

fn open_mode(flags: OpenFlags) -> OpenMode {
    OpenMode {
        create: flags.contains(OpenFlags::CREATE),
        rdwr: flags.contains(OpenFlags::RDWR),
        sync: flags.contains(OpenFlags::NOCACHE),
    }
}

impl Raw {
    /// Creates the file; contents are left to the caller.
    pub fn create(filename: &str) -> BlockResult {
        if filename.is_empty() {
            return Err(BlockError::IncompleteParameters);
        }
        FileBackend::create(filename)?;
        Ok(())
    }

    pub fn open(filename: &str, flags: OpenFlags) -> BlockResult<Arc<Raw>> {
        if filename.is_empty() {
            return Err(BlockError::IncompleteParameters);
        }
        let file = FileBackend::open(filename, open_mode(flags))?;
        Ok(Arc::new(Raw {
            common: BdsCommon::new(filename.to_string(), flags),
            file,
        }))
    }

    pub fn backend(&self) -> &FileBackend {
        &self.file
    }
}

impl BlockNode for Raw {
    fn common(&self) -> &BdsCommon {
        &self.common
    }

    fn format_name(&self) -> &'static str {
        "raw"
    }

    fn drv_preadv_part(
        &self,
        offset: u64,
        bytes: u64,
        qiov: &mut IoVecMut<'_>,
        qiov_offset: u64,
        _flags: ReqFlags,
    ) -> BlockResult {
        if qiov_offset > 0 || bytes != qiov.size() {
            let mut local = qiov.slice_mut(qiov_offset, bytes);
            self.file.preadv_at(offset, &mut local)?;
        } else {
            self.file.preadv_at(offset, qiov)?;
        }
        Ok(())
    }

    fn drv_pwritev_part(
        &self,
        offset: u64,
        bytes: u64,
        qiov: &IoVec<'_>,
        qiov_offset: u64,
        _flags: ReqFlags,
    ) -> BlockResult {
        if qiov_offset > 0 || bytes != qiov.size() {
            let local = qiov.slice(qiov_offset, bytes);
            self.file.pwritev_at(offset, &local)?;
        } else {
            self.file.pwritev_at(offset, qiov)?;
        }
        Ok(())
    }

    fn drv_flush_to_disk(&self) -> BlockResult {
        self.file.flush_to_disk()?;
        Ok(())
    }

    fn drv_getlength(&self) -> BlockResult<u64> {
        Ok(self.file.len()?)
    }

    fn drv_close(&self) {
        // Dropping the backend closes the descriptor; nothing to do early.
    }
}
