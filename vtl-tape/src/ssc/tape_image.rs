//! Virtual tape image format
//!
//! A tape image is a doubly linked chain of blocks. Each block starts with
//! a fixed size little endian header, followed by the (optionally
//! compressed) payload:
//!
//! ```text
//! | BOT + MAM | Data | Data | Filemark | Data | ... | EOD |
//! ```
//!
//! The header stores absolute offsets of the previous, current and next
//! block. The first block is always a BOT block carrying the medium
//! auxiliary memory, the last one is always an EOD block. Writing in the
//! middle of the tape truncates everything behind the write position.

use std::io::{Read, Write};

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use super::encryption::{EncryptionKey, EncryptionState, NextBlockStatus};
use super::mam::{MediumAuxMemory, MediumKind};
use super::media_store::MediaStore;
use crate::sense::{ScsiError, SenseInfo};

/// On media size of a block header
pub const BLOCK_HEADER_SIZE: usize = 512;

const MAX_KEY_SIZE: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockType {
    BeginningOfTape,
    Data,
    Filemark,
    EndOfData,
    NoOp,
    /// BOT written by old tools, without cartridge memory
    LegacyBeginningOfTape,
}

impl BlockType {
    fn to_raw(self) -> u32 {
        match self {
            BlockType::BeginningOfTape => 0x01,
            BlockType::Data => 0x02,
            BlockType::Filemark => 0x03,
            BlockType::EndOfData => 0x04,
            BlockType::NoOp => 0x05,
            BlockType::LegacyBeginningOfTape => 0x10,
        }
    }

    fn from_raw(value: u32) -> Option<Self> {
        Some(match value {
            0x01 => BlockType::BeginningOfTape,
            0x02 => BlockType::Data,
            0x03 => BlockType::Filemark,
            0x04 => BlockType::EndOfData,
            0x05 => BlockType::NoOp,
            0x10 => BlockType::LegacyBeginningOfTape,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    pub struct BlockFlags: u32 {
        const COMPRESSED = 0x01;
        const ENCRYPTED = 0x02;
    }
}

#[derive(Endian)]
#[repr(C, packed)]
struct RawBlockHeader {
    prev: u64,
    curr: u64,
    next: u64,
    block_type: u32,
    block_flags: u32,
    block_number: u32,
    block_size: u32,
    disk_block_size: u32,
    key_len: u32,
    ukad_len: u32,
    akad_len: u32,
    key: [u8; MAX_KEY_SIZE],
    ukad: [u8; MAX_KEY_SIZE],
    akad: [u8; MAX_KEY_SIZE],
}

/// Decoded block header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub prev: u64,
    pub curr: u64,
    pub next: u64,
    pub block_type: BlockType,
    pub flags: BlockFlags,
    /// Logical object number (data blocks and filemarks count)
    pub block_number: u32,
    /// Logical (uncompressed) size
    pub block_size: u32,
    /// Size stored on media
    pub disk_block_size: u32,
    pub key: Option<EncryptionKey>,
}

fn key_field(data: &[u8]) -> Result<[u8; MAX_KEY_SIZE], Error> {
    if data.len() > MAX_KEY_SIZE {
        bail!("key material too long ({} > {})", data.len(), MAX_KEY_SIZE);
    }
    let mut field = [0u8; MAX_KEY_SIZE];
    field[..data.len()].copy_from_slice(data);
    Ok(field)
}

fn key_from_field(field: &[u8; MAX_KEY_SIZE], len: u32) -> Option<Vec<u8>> {
    field.get(..len as usize).map(|data| data.to_vec())
}

impl BlockHeader {
    fn new(block_type: BlockType, curr: u64, prev: u64, block_number: u32) -> Self {
        Self {
            prev,
            curr,
            next: curr + BLOCK_HEADER_SIZE as u64,
            block_type,
            flags: BlockFlags::empty(),
            block_number,
            block_size: 0,
            disk_block_size: 0,
            key: None,
        }
    }

    fn with_payload(mut self, block_size: u32, disk_block_size: u32) -> Self {
        self.block_size = block_size;
        self.disk_block_size = disk_block_size;
        self.next = self.curr + (BLOCK_HEADER_SIZE as u64) + disk_block_size as u64;
        self
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        let empty = EncryptionKey::default();
        let key = self.key.as_ref().unwrap_or(&empty);

        let raw = RawBlockHeader {
            prev: self.prev,
            curr: self.curr,
            next: self.next,
            block_type: self.block_type.to_raw(),
            block_flags: self.flags.bits(),
            block_number: self.block_number,
            block_size: self.block_size,
            disk_block_size: self.disk_block_size,
            key_len: key.key.len() as u32,
            ukad_len: key.ukad.len() as u32,
            akad_len: key.akad.len() as u32,
            key: key_field(&key.key)?,
            ukad: key_field(&key.ukad)?,
            akad: key_field(&key.akad)?,
        };

        let mut data = Vec::with_capacity(BLOCK_HEADER_SIZE);
        unsafe { data.write_le_value(raw)? };
        data.resize(BLOCK_HEADER_SIZE, 0);
        Ok(data)
    }

    fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut reader = data;
        let raw: RawBlockHeader = unsafe { reader.read_le_value()? };

        let raw_type = raw.block_type;
        let block_type = BlockType::from_raw(raw_type)
            .ok_or_else(|| format_err!("unknown block type {:#x}", raw_type))?;
        let flags = BlockFlags::from_bits_truncate(raw.block_flags);

        let key = if flags.contains(BlockFlags::ENCRYPTED) {
            let invalid = || format_err!("invalid key length in block header");
            Some(EncryptionKey {
                key: key_from_field(&raw.key, raw.key_len).ok_or_else(invalid)?,
                ukad: key_from_field(&raw.ukad, raw.ukad_len).ok_or_else(invalid)?,
                akad: key_from_field(&raw.akad, raw.akad_len).ok_or_else(invalid)?,
            })
        } else {
            None
        };

        Ok(Self {
            prev: raw.prev,
            curr: raw.curr,
            next: raw.next,
            block_type,
            flags,
            block_number: raw.block_number,
            block_size: raw.block_size,
            disk_block_size: raw.disk_block_size,
            key,
        })
    }
}

/// Logical position as reported by READ POSITION
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TapePosition {
    pub offset: u64,
    pub block_type: BlockType,
    pub block_number: u64,
    pub filemarks: u64,
}

/// Result of reading one data block
#[derive(Debug)]
pub struct BlockRead {
    /// Payload truncated or zero padded to the requested length
    pub data: Vec<u8>,
    /// Actual logical block size
    pub block_size: usize,
    /// Length mismatch not suppressed by SILI
    pub ili: bool,
}

#[derive(Default)]
pub struct WriteOptions<'a> {
    /// zlib level, `None` disables compression
    pub compression: Option<u32>,
    pub encryption: Option<&'a EncryptionKey>,
    /// Bytes before the end of medium where early warning starts
    pub early_warning: u64,
    pub prog_early_warning: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct WriteStatus {
    pub early_warning: bool,
    pub prog_early_warning: bool,
}

/// Loaded tape image with its head position
pub struct TapeImage {
    store: Box<dyn MediaStore>,
    mam: MediumAuxMemory,
    bot: BlockHeader,
    current: BlockHeader,
    /// Filemarks between BOT and the current position
    filemarks: u64,
    legacy: bool,
}

impl TapeImage {
    /// Write an empty tape (BOT with cartridge memory, then EOD)
    pub fn format(mut store: Box<dyn MediaStore>, mam: MediumAuxMemory) -> Result<Self, Error> {
        let payload = mam.encode()?;
        let bot = BlockHeader::new(BlockType::BeginningOfTape, 0, 0, 0)
            .with_payload(payload.len() as u32, payload.len() as u32);
        let eod = BlockHeader::new(BlockType::EndOfData, bot.next, 0, 0);

        store.truncate(0)?;
        store.write_at(0, &bot.encode()?)?;
        store.write_at(BLOCK_HEADER_SIZE as u64, &payload)?;
        store.write_at(eod.curr, &eod.encode()?)?;
        store.sync()?;

        Self::open(store)
    }

    /// Open an existing image and position at BOT
    pub fn open(mut store: Box<dyn MediaStore>) -> Result<Self, Error> {
        let bot = read_header(store.as_mut(), 0)?;

        let (mam, legacy) = match bot.block_type {
            BlockType::BeginningOfTape => {
                let mut payload = vec![0u8; bot.disk_block_size as usize];
                store.read_at(BLOCK_HEADER_SIZE as u64, &mut payload)?;
                (MediumAuxMemory::decode(&payload)?, false)
            }
            BlockType::LegacyBeginningOfTape => {
                log::warn!("tape image without cartridge memory, loading read-only");
                let mut mam =
                    MediumAuxMemory::new("", "", MediumKind::Data, 0, store.size()?)?;
                mam.write_protect = true;
                (mam, true)
            }
            other => bail!("tape image does not start with BOT (found {:?})", other),
        };

        let mut image = Self {
            store,
            mam,
            current: bot.clone(),
            bot,
            filemarks: 0,
            legacy,
        };
        image.rewind().map_err(|err| format_err!("unable to rewind tape image - {}", err))?;
        Ok(image)
    }

    pub fn mam(&self) -> &MediumAuxMemory {
        &self.mam
    }

    pub fn mam_mut(&mut self) -> &mut MediumAuxMemory {
        &mut self.mam
    }

    pub fn current(&self) -> &BlockHeader {
        &self.current
    }

    pub fn position(&self) -> TapePosition {
        TapePosition {
            offset: self.current.curr,
            block_type: self.current.block_type,
            block_number: self.current.block_number as u64,
            filemarks: self.filemarks,
        }
    }

    pub fn at_bot(&self) -> bool {
        self.current.curr == self.bot.next
    }

    pub fn at_eod(&self) -> bool {
        self.current.block_type == BlockType::EndOfData
    }

    pub fn is_write_protected(&self) -> bool {
        self.legacy || self.mam.write_protect || self.store.read_only()
    }

    /// Bytes left until the native capacity is reached
    pub fn remaining_capacity(&self) -> Result<u64, Error> {
        Ok(self.mam.max_capacity.saturating_sub(self.store.size()?))
    }

    /// Position is inside the early warning zone
    pub fn in_early_warning(&self, early_warning: u64) -> bool {
        let used = self.current.next;
        self.mam.max_capacity.saturating_sub(used) < early_warning
    }

    pub fn rewind(&mut self) -> Result<(), ScsiError> {
        self.current = self.load_header(self.bot.next)?;
        self.filemarks = 0;
        self.skip_noop_forward()
    }

    fn load_header(&mut self, offset: u64) -> Result<BlockHeader, ScsiError> {
        match read_header(self.store.as_mut(), offset) {
            Ok(header) => Ok(header),
            Err(err) => {
                log::error!("reading block header at {} failed - {}", offset, err);
                Err(SenseInfo::MEDIUM_FORMAT_CORRUPTED.into())
            }
        }
    }

    fn skip_noop_forward(&mut self) -> Result<(), ScsiError> {
        while self.current.block_type == BlockType::NoOp {
            self.step_forward()?;
        }
        Ok(())
    }

    fn step_forward(&mut self) -> Result<(), ScsiError> {
        if self.current.block_type == BlockType::EndOfData {
            return Err(SenseInfo::END_OF_DATA.into());
        }

        let next = self.load_header(self.current.next)?;
        if next.prev != self.current.curr || next.curr != self.current.next {
            log::error!(
                "tape image corrupt: block at {} does not link back to {}",
                next.curr,
                self.current.curr
            );
            return Err(SenseInfo::MEDIUM_FORMAT_CORRUPTED.into());
        }
        // only count the filemark once it is actually passed
        if self.current.block_type == BlockType::Filemark {
            self.filemarks += 1;
        }
        self.current = next;
        Ok(())
    }

    fn step_backward(&mut self) -> Result<(), ScsiError> {
        if self.at_bot() {
            return Err(SenseInfo::BEGINNING_OF_PARTITION.into());
        }

        let prev = self.load_header(self.current.prev)?;
        if prev.next != self.current.curr {
            log::error!(
                "tape image corrupt: block at {} does not link forward to {}",
                prev.curr,
                self.current.curr
            );
            return Err(SenseInfo::MEDIUM_FORMAT_CORRUPTED.into());
        }
        if prev.block_type == BlockType::Filemark {
            self.filemarks = self.filemarks.saturating_sub(1);
        }
        self.current = prev;
        Ok(())
    }

    /// Move over `count` blocks (data or filemark) towards EOD
    pub fn position_forward(&mut self, count: u64) -> Result<(), ScsiError> {
        for _ in 0..count {
            self.step_forward()?;
            self.skip_noop_forward()?;
        }
        Ok(())
    }

    /// Move over `count` blocks (data or filemark) towards BOT
    pub fn position_backward(&mut self, count: u64) -> Result<(), ScsiError> {
        for _ in 0..count {
            self.step_backward()?;
            while self.current.block_type == BlockType::NoOp {
                self.step_backward()?;
            }
        }
        Ok(())
    }

    /// SPACE blocks, negative counts move towards BOT
    ///
    /// A filemark terminates the command, leaving the head on the far
    /// side of the filemark (in direction of movement). The information
    /// field holds the number of blocks not spaced.
    pub fn space_blocks(&mut self, count: i64) -> Result<(), ScsiError> {
        let todo = count.unsigned_abs();
        if count >= 0 {
            for done in 0..todo {
                let residue = (todo - done) as u32;
                match self.current.block_type {
                    BlockType::EndOfData => {
                        return Err(SenseInfo::END_OF_DATA.information(residue).into())
                    }
                    BlockType::Filemark => {
                        self.position_forward(1)?;
                        return Err(SenseInfo::FILEMARK_DETECTED.information(residue).into());
                    }
                    _ => self.position_forward(1)?,
                }
            }
        } else {
            for done in 0..todo {
                let residue = (todo - done) as u32;
                if self.at_bot() {
                    return Err(SenseInfo::BEGINNING_OF_PARTITION
                        .information(residue)
                        .into());
                }
                self.position_backward(1)?;
                if self.current.block_type == BlockType::Filemark {
                    return Err(SenseInfo::FILEMARK_DETECTED.information(residue).into());
                }
            }
        }
        Ok(())
    }

    /// SPACE filemarks, negative counts move towards BOT
    ///
    /// Forward spacing ends behind the last filemark, backward spacing
    /// ends in front of it.
    pub fn space_filemarks(&mut self, count: i64) -> Result<(), ScsiError> {
        let mut todo = count.unsigned_abs();
        if count >= 0 {
            while todo > 0 {
                match self.current.block_type {
                    BlockType::EndOfData => {
                        return Err(SenseInfo::END_OF_DATA.information(todo as u32).into())
                    }
                    BlockType::Filemark => todo -= 1,
                    _ => {}
                }
                self.position_forward(1)?;
            }
        } else {
            while todo > 0 {
                if self.at_bot() {
                    return Err(SenseInfo::BEGINNING_OF_PARTITION
                        .information(todo as u32)
                        .into());
                }
                self.position_backward(1)?;
                if self.current.block_type == BlockType::Filemark {
                    todo -= 1;
                }
            }
        }
        Ok(())
    }

    pub fn space_eod(&mut self) -> Result<(), ScsiError> {
        while !self.at_eod() {
            self.position_forward(1)?;
        }
        Ok(())
    }

    /// LOCATE to a logical object number
    pub fn locate_block(&mut self, block_number: u64) -> Result<(), ScsiError> {
        if block_number < self.current.block_number as u64 {
            self.rewind()?;
        }
        while (self.current.block_number as u64) < block_number {
            if self.at_eod() {
                return Err(SenseInfo::END_OF_DATA.into());
            }
            self.position_forward(1)?;
        }
        Ok(())
    }

    /// LOCATE to filemark `number` (zero based), in front of the filemark
    pub fn locate_filemark(&mut self, number: u64) -> Result<(), ScsiError> {
        self.rewind()?;
        loop {
            match self.current.block_type {
                BlockType::EndOfData => return Err(SenseInfo::END_OF_DATA.into()),
                BlockType::Filemark if self.filemarks == number => return Ok(()),
                _ => self.position_forward(1)?,
            }
        }
    }

    /// Encryption status of the block under the head
    pub fn next_block_status(&self, encryption: &EncryptionState) -> NextBlockStatus {
        match (self.current.block_type, &self.current.key) {
            (BlockType::Data, None) => NextBlockStatus::NotEncrypted,
            (BlockType::Data, Some(key)) => {
                let key_matches = matches!(
                    encryption.key,
                    Some(ref active) if active.key == key.key && active.ukad == key.ukad
                );
                NextBlockStatus::Encrypted { key_matches }
            }
            _ => NextBlockStatus::NotALogicalBlock,
        }
    }

    /// Read the block under the head and move behind it
    ///
    /// Encryption is checked before the head moves, so a refused block
    /// leaves the position unchanged. A filemark is passed over and
    /// reported as FILEMARK DETECTED.
    pub fn read_block(
        &mut self,
        max_len: usize,
        sili: bool,
        encryption: &EncryptionState,
    ) -> Result<BlockRead, ScsiError> {
        match self.current.block_type {
            BlockType::EndOfData => return Err(SenseInfo::END_OF_DATA.into()),
            BlockType::Filemark => {
                self.position_forward(1)?;
                return Err(SenseInfo::FILEMARK_DETECTED.into());
            }
            BlockType::Data => {}
            other => {
                log::error!("unexpected {:?} block at {}", other, self.current.curr);
                return Err(SenseInfo::MEDIUM_FORMAT_CORRUPTED.into());
            }
        }

        encryption.check_block(self.current.key.as_ref())?;

        let room = self
            .current
            .next
            .checked_sub(self.current.curr + BLOCK_HEADER_SIZE as u64);
        match room {
            Some(room) if self.current.disk_block_size as u64 <= room => {}
            _ => {
                log::error!(
                    "block at {} claims {} bytes on media, next block at {}",
                    self.current.curr,
                    self.current.disk_block_size,
                    self.current.next
                );
                return Err(SenseInfo::MEDIUM_FORMAT_CORRUPTED.into());
            }
        }

        let mut payload = vec![0u8; self.current.disk_block_size as usize];
        let offset = self.current.curr + BLOCK_HEADER_SIZE as u64;
        if let Err(err) = self.store.read_at(offset, &mut payload) {
            log::error!("reading block at {} failed - {}", self.current.curr, err);
            return Err(SenseInfo::UNRECOVERED_READ_ERROR.into());
        }

        let mut data = if self.current.flags.contains(BlockFlags::COMPRESSED) {
            // one byte more than announced is enough to detect a size mismatch
            let limit = self.current.block_size as u64 + 1;
            let mut data = Vec::new();
            if let Err(err) = flate2::read::ZlibDecoder::new(&payload[..])
                .take(limit)
                .read_to_end(&mut data)
            {
                log::error!("decompressing block at {} failed - {}", self.current.curr, err);
                return Err(SenseInfo::UNRECOVERED_READ_ERROR.into());
            }
            data
        } else {
            payload
        };

        let block_size = self.current.block_size as usize;
        if data.len() != block_size {
            log::error!(
                "block at {} has size {} but header says {}",
                self.current.curr,
                data.len(),
                block_size
            );
            return Err(SenseInfo::MEDIUM_FORMAT_CORRUPTED.into());
        }
        data.resize(max_len, 0);

        self.position_forward(1)?;

        self.mam.bytes_read += block_size as u64;
        self.mam.last_bytes_read += block_size as u64;

        Ok(BlockRead {
            data,
            block_size,
            ili: block_size != max_len && !sili,
        })
    }

    fn check_writable(&self) -> Result<(), ScsiError> {
        if self.is_write_protected() {
            return Err(SenseInfo::WRITE_PROTECTED.into());
        }
        if self.mam.medium_kind == MediumKind::Worm && !self.at_eod() {
            return Err(SenseInfo::WORM_OVERWRITE_ATTEMPTED.into());
        }
        Ok(())
    }

    /// Write `header` (plus payload) at the current position, followed
    /// by a new EOD. Everything behind is discarded.
    fn append(&mut self, mut header: BlockHeader, payload: &[u8]) -> Result<(), ScsiError> {
        header.curr = self.current.curr;
        header.prev = self.current.prev;
        header.block_number = self.current.block_number;
        let header = header.with_payload(header.block_size, payload.len() as u32);

        let eod = BlockHeader::new(
            BlockType::EndOfData,
            header.next,
            header.curr,
            header.block_number + 1,
        );

        let result: Result<(), Error> = proxmox_lang::try_block!({
            self.store.write_at(header.curr, &header.encode()?)?;
            if !payload.is_empty() {
                self.store.write_at(header.curr + BLOCK_HEADER_SIZE as u64, payload)?;
            }
            self.store.write_at(eod.curr, &eod.encode()?)?;
            self.store.truncate(eod.next)?;
            Ok(())
        });
        if let Err(err) = result {
            log::error!("writing block at {} failed - {}", header.curr, err);
            return Err(SenseInfo::WRITE_ERROR.into());
        }

        if header.block_type == BlockType::Filemark {
            self.filemarks += 1;
        }
        self.current = eod;
        Ok(())
    }

    /// Write one data block at the current position
    pub fn write_block(
        &mut self,
        data: &[u8],
        options: &WriteOptions,
    ) -> Result<WriteStatus, ScsiError> {
        self.check_writable()?;

        let mut flags = BlockFlags::empty();

        let compressed = match options.compression {
            Some(level) => {
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(data.len()),
                    flate2::Compression::new(level),
                );
                encoder.write_all(data)?;
                let compressed = encoder.finish()?;
                if compressed.len() < data.len() {
                    flags |= BlockFlags::COMPRESSED;
                    Some(compressed)
                } else {
                    None
                }
            }
            None => None,
        };
        let payload = compressed.as_deref().unwrap_or(data);

        let end = self.current.curr + 2 * BLOCK_HEADER_SIZE as u64 + payload.len() as u64;
        if end > self.mam.max_capacity {
            return Err(SenseInfo::VOLUME_OVERFLOW.into());
        }

        let key = match options.encryption {
            Some(key) => {
                if key.key.len() > MAX_KEY_SIZE
                    || key.ukad.len() > MAX_KEY_SIZE
                    || key.akad.len() > MAX_KEY_SIZE
                {
                    return Err(format_err!("encryption key material too long").into());
                }
                flags |= BlockFlags::ENCRYPTED;
                Some(key.clone())
            }
            None => None,
        };

        let mut header = BlockHeader::new(BlockType::Data, 0, 0, 0);
        header.flags = flags;
        header.block_size = data.len() as u32;
        header.key = key;

        self.append(header, payload)?;

        self.mam.bytes_written += data.len() as u64;
        self.mam.last_bytes_written += data.len() as u64;

        let remaining = self.mam.max_capacity.saturating_sub(end);
        Ok(WriteStatus {
            early_warning: remaining < options.early_warning,
            prog_early_warning: remaining < options.prog_early_warning,
        })
    }

    pub fn write_filemarks(&mut self, count: u32) -> Result<(), ScsiError> {
        if count == 0 {
            // flush only
            self.store.sync()?;
            return Ok(());
        }
        self.check_writable()?;

        for _ in 0..count {
            let end = self.current.curr + 2 * BLOCK_HEADER_SIZE as u64;
            if end > self.mam.max_capacity {
                return Err(SenseInfo::VOLUME_OVERFLOW.into());
            }
            let header = BlockHeader::new(BlockType::Filemark, 0, 0, 0);
            self.append(header, &[])?;
        }
        Ok(())
    }

    /// Discard everything from the current position on
    pub fn erase(&mut self) -> Result<(), ScsiError> {
        if self.is_write_protected() {
            return Err(SenseInfo::WRITE_PROTECTED.into());
        }
        if self.mam.medium_kind == MediumKind::Worm && !self.at_eod() {
            return Err(SenseInfo::WORM_OVERWRITE_ATTEMPTED.into());
        }

        let eod = BlockHeader::new(
            BlockType::EndOfData,
            self.current.curr,
            self.current.prev,
            self.current.block_number,
        );
        let result: Result<(), Error> = proxmox_lang::try_block!({
            self.store.write_at(eod.curr, &eod.encode()?)?;
            self.store.truncate(eod.next)?;
            Ok(())
        });
        if let Err(err) = result {
            log::error!("erase at {} failed - {}", eod.curr, err);
            return Err(SenseInfo::WRITE_ERROR.into());
        }
        self.current = eod;
        Ok(())
    }

    /// Store the cartridge memory back into the BOT block
    pub fn flush_mam(&mut self) -> Result<(), Error> {
        if self.legacy || self.store.read_only() {
            return Ok(());
        }
        let payload = self.mam.encode()?;
        if payload.len() != self.bot.disk_block_size as usize {
            bail!(
                "cartridge memory size changed ({} != {})",
                payload.len(),
                self.bot.disk_block_size
            );
        }
        self.store.write_at(BLOCK_HEADER_SIZE as u64, &payload)?;
        self.store.sync()
    }

    /// Flush cartridge memory and give back the store
    pub fn close(mut self) -> Result<Box<dyn MediaStore>, Error> {
        self.flush_mam()?;
        Ok(self.store)
    }
}

fn read_header(store: &mut dyn MediaStore, offset: u64) -> Result<BlockHeader, Error> {
    let mut data = [0u8; BLOCK_HEADER_SIZE];
    store.read_at(offset, &mut data)?;
    let header = BlockHeader::decode(&data)?;
    if header.curr != offset {
        bail!("block header at {} claims offset {}", offset, header.curr);
    }
    Ok(header)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ssc::encryption::DecryptMode;
    use crate::ssc::mam::MAM_SIZE;
    use crate::ssc::media_store::MemoryStore;

    // block 0 header plus cartridge memory
    const BOT_SIZE: usize = BLOCK_HEADER_SIZE + MAM_SIZE;

    fn new_image(kind: MediumKind, capacity: u64) -> Result<(TapeImage, MemoryStore), Error> {
        let store = MemoryStore::new();
        let mam = MediumAuxMemory::new("TEST01L6", "LTO6", kind, 0x5a, capacity)?;
        let image = TapeImage::format(Box::new(store.clone()), mam)?;
        Ok((image, store))
    }

    fn write(image: &mut TapeImage, data: &[u8]) -> Result<WriteStatus, ScsiError> {
        image.write_block(data, &WriteOptions::default())
    }

    fn sense(result: Result<impl std::fmt::Debug, ScsiError>) -> SenseInfo {
        match result {
            Err(ScsiError::Sense(sense)) => sense,
            other => panic!("expected sense, got {:?}", other),
        }
    }

    #[test]
    fn format_and_reopen() -> Result<(), Error> {
        let (image, store) = new_image(MediumKind::Data, 1 << 30)?;
        assert!(image.at_bot());
        assert!(image.at_eod());
        assert_eq!(store.size()?, (BOT_SIZE + BLOCK_HEADER_SIZE) as u64);

        let image = TapeImage::open(Box::new(store))?;
        assert_eq!(image.mam().barcode, "TEST01L6");
        assert_eq!(image.mam().medium_name, "LTO6");
        Ok(())
    }

    #[test]
    fn walk_forward_backward() -> Result<(), Error> {
        let (mut image, _store) = new_image(MediumKind::Data, 1 << 30)?;
        for i in 0..5u8 {
            write(&mut image, &[i; 100])?;
        }
        image.write_filemarks(1)?;
        write(&mut image, &[9; 100])?;

        image.rewind()?;
        image.position_forward(2)?;
        let start = image.position();

        image.position_forward(4)?;
        assert_eq!(image.position().filemarks, 1);
        image.position_backward(4)?;
        assert_eq!(image.position(), start);

        image.position_forward(5)?;
        assert!(image.at_eod());
        assert!(image.position_forward(1).is_err());
        Ok(())
    }

    #[test]
    fn write_back_read() -> Result<(), Error> {
        let (mut image, _store) = new_image(MediumKind::Data, 1 << 30)?;
        let data: Vec<u8> = (0..4096u32).map(|v| (v % 251) as u8).collect();
        write(&mut image, &data)?;
        image.position_backward(1)?;

        let read = image.read_block(data.len(), false, &EncryptionState::default())?;
        assert!(!read.ili);
        assert_eq!(read.data, data);

        image.position_backward(1)?;
        let read = image.read_block(100, false, &EncryptionState::default())?;
        assert!(read.ili);
        assert_eq!(read.data.len(), 100);

        image.position_backward(1)?;
        let read = image.read_block(100, true, &EncryptionState::default())?;
        assert!(!read.ili);
        assert_eq!(read.data, &data[..100]);

        assert_eq!(
            sense(image.read_block(100, false, &EncryptionState::default())),
            SenseInfo::END_OF_DATA
        );
        Ok(())
    }

    #[test]
    fn compressed_block() -> Result<(), Error> {
        let (mut image, _store) = new_image(MediumKind::Data, 1 << 30)?;
        let data = vec![0x55u8; 64 * 1024];
        image.write_block(
            &data,
            &WriteOptions {
                compression: Some(6),
                ..Default::default()
            },
        )?;
        image.rewind()?;
        assert!(image.current().flags.contains(BlockFlags::COMPRESSED));
        assert!((image.current().disk_block_size as usize) < data.len());

        let read = image.read_block(data.len(), false, &EncryptionState::default())?;
        assert_eq!(read.data, data);
        Ok(())
    }

    #[test]
    fn space_over_filemark() -> Result<(), Error> {
        let (mut image, _store) = new_image(MediumKind::Data, 1 << 30)?;
        write(&mut image, b"one")?;
        image.write_filemarks(1)?;
        write(&mut image, b"two")?;
        image.write_filemarks(1)?;

        image.rewind()?;
        let err = sense(image.space_blocks(3));
        assert_eq!(err.asc, 0);
        assert_eq!(err.ascq, 1);
        assert_eq!(err.information, Some(2));
        assert_eq!(image.position().block_number, 2);

        let err = sense(image.space_blocks(-2));
        assert_eq!(err.ascq, 1);
        assert_eq!(image.position().block_type, BlockType::Filemark);

        image.rewind()?;
        image.space_filemarks(2)?;
        assert!(image.at_eod());
        image.space_filemarks(-1)?;
        assert_eq!(image.position().block_number, 3);

        let err = sense(image.space_filemarks(-5));
        assert_eq!(err.ascq, 4);
        assert!(image.at_bot());
        Ok(())
    }

    #[test]
    fn locate() -> Result<(), Error> {
        let (mut image, _store) = new_image(MediumKind::Data, 1 << 30)?;
        for _ in 0..3 {
            write(&mut image, b"data")?;
            image.write_filemarks(1)?;
        }

        image.locate_block(4)?;
        assert_eq!(image.position().block_number, 4);
        image.locate_block(1)?;
        assert_eq!(image.position().block_type, BlockType::Filemark);

        image.locate_filemark(1)?;
        assert_eq!(image.position().block_number, 3);
        assert_eq!(image.position().filemarks, 1);

        assert_eq!(sense(image.locate_block(100)), SenseInfo::END_OF_DATA);
        assert_eq!(sense(image.locate_filemark(3)), SenseInfo::END_OF_DATA);
        Ok(())
    }

    #[test]
    fn overwrite_truncates() -> Result<(), Error> {
        let (mut image, store) = new_image(MediumKind::Data, 1 << 30)?;
        for _ in 0..4 {
            write(&mut image, &[1u8; 1000])?;
        }
        image.rewind()?;
        image.position_forward(1)?;
        write(&mut image, b"short")?;
        assert!(image.at_eod());
        assert_eq!(image.position().block_number, 2);

        let expected = BOT_SIZE + 2 * BLOCK_HEADER_SIZE + 1000 + 5 + BLOCK_HEADER_SIZE;
        assert_eq!(store.size()?, expected as u64);
        Ok(())
    }

    #[test]
    fn worm_and_write_protect() -> Result<(), Error> {
        let (mut image, _store) = new_image(MediumKind::Worm, 1 << 30)?;
        write(&mut image, b"first")?;
        image.rewind()?;
        assert_eq!(sense(write(&mut image, b"again")), SenseInfo::WORM_OVERWRITE_ATTEMPTED);
        image.space_eod()?;
        write(&mut image, b"append")?;

        image.mam_mut().write_protect = true;
        assert_eq!(sense(write(&mut image, b"x")), SenseInfo::WRITE_PROTECTED);
        Ok(())
    }

    #[test]
    fn capacity_warnings() -> Result<(), Error> {
        let capacity = (BOT_SIZE + 10 * 1024) as u64;
        let (mut image, _store) = new_image(MediumKind::Data, capacity)?;
        let options = WriteOptions {
            early_warning: 4096,
            prog_early_warning: 6144,
            ..Default::default()
        };

        let status = image.write_block(&[0u8; 1024], &options)?;
        assert_eq!(status, WriteStatus::default());

        let status = image.write_block(&[0u8; 4096], &options)?;
        assert!(status.prog_early_warning);
        assert!(status.early_warning);

        assert_eq!(
            sense(image.write_block(&[0u8; 4096], &options)),
            SenseInfo::VOLUME_OVERFLOW
        );
        Ok(())
    }

    #[test]
    fn encrypted_block_wrong_key() -> Result<(), Error> {
        let (mut image, _store) = new_image(MediumKind::Data, 1 << 30)?;
        let k1 = EncryptionKey {
            key: vec![1u8; 32],
            ..Default::default()
        };
        let k2 = EncryptionKey {
            key: vec![2u8; 32],
            ..Default::default()
        };

        image.write_block(
            b"secret",
            &WriteOptions {
                encryption: Some(&k1),
                ..Default::default()
            },
        )?;
        image.rewind()?;

        let mut state = EncryptionState::default();
        state.decrypt = DecryptMode::Decrypt;
        state.key = Some(k2);

        let before = image.position();
        assert_eq!(sense(image.read_block(6, false, &state)), SenseInfo::INCORRECT_KEY);
        assert_eq!(image.position(), before);
        assert_eq!(
            image.next_block_status(&state),
            NextBlockStatus::Encrypted { key_matches: false }
        );

        state.key = Some(k1);
        let read = image.read_block(6, false, &state)?;
        assert_eq!(read.data, b"secret");
        Ok(())
    }

    #[test]
    fn corrupt_link() -> Result<(), Error> {
        let (mut image, mut store) = new_image(MediumKind::Data, 1 << 30)?;
        write(&mut image, b"one")?;
        write(&mut image, b"two")?;

        // break the back link of the second block
        let second = (BOT_SIZE + BLOCK_HEADER_SIZE + 3) as u64;
        store.write_at(second, &0xdeadu64.to_le_bytes())?;

        image.rewind()?;
        assert_eq!(sense(image.position_forward(1)), SenseInfo::MEDIUM_FORMAT_CORRUPTED);
        assert_eq!(image.position().block_number, 0);

        // the unit stays usable
        image.rewind()?;
        let read = image.read_block(3, false, &EncryptionState::default())?;
        assert_eq!(read.data, b"one");
        Ok(())
    }

    #[test]
    fn corrupt_link_after_filemark() -> Result<(), Error> {
        let (mut image, mut store) = new_image(MediumKind::Data, 1 << 30)?;
        write(&mut image, b"one")?;
        image.write_filemarks(1)?;
        write(&mut image, b"two")?;

        // back link of the block behind the filemark
        let behind = (BOT_SIZE + BLOCK_HEADER_SIZE + 3 + BLOCK_HEADER_SIZE) as u64;
        store.write_at(behind, &0xdeadu64.to_le_bytes())?;

        image.rewind()?;
        image.position_forward(1)?;
        let on_filemark = image.position();
        assert_eq!(on_filemark.block_type, BlockType::Filemark);
        assert_eq!(on_filemark.filemarks, 0);

        assert_eq!(sense(image.position_forward(1)), SenseInfo::MEDIUM_FORMAT_CORRUPTED);
        assert_eq!(image.position(), on_filemark);

        image.rewind()?;
        assert_eq!(image.position().filemarks, 0);
        Ok(())
    }

    #[test]
    fn inflated_block_size() -> Result<(), Error> {
        let (mut image, mut store) = new_image(MediumKind::Data, 1 << 30)?;
        write(&mut image, b"one")?;
        write(&mut image, b"two")?;

        // disk_block_size of the first data block
        let field = (BOT_SIZE + 40) as u64;
        store.write_at(field, &0xffff_fff0u32.to_le_bytes())?;

        image.rewind()?;
        let state = EncryptionState::default();
        assert_eq!(sense(image.read_block(3, false, &state)), SenseInfo::MEDIUM_FORMAT_CORRUPTED);
        assert_eq!(image.position().block_number, 0);

        // the following block is still reachable
        image.position_forward(1)?;
        let read = image.read_block(3, false, &state)?;
        assert_eq!(read.data, b"two");
        Ok(())
    }
}
