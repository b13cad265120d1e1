//! Tape data encryption (SECURITY PROTOCOL IN/OUT, protocol 20h)
//!
//! Only the protocol visible state is emulated: keys are remembered and
//! stamped into the block headers, the payload is stored as is.

use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use crate::sense::SenseInfo;

/// Security protocol: information
pub const SECURITY_PROTOCOL_INFO: u8 = 0x00;
/// Security protocol: tape data encryption
pub const SECURITY_PROTOCOL_TAPE: u8 = 0x20;

pub const SPIN_SUPPORTED_PAGES: u16 = 0x0000;
pub const SPIN_SUPPORTED_KEY_FORMATS: u16 = 0x0011;
pub const SPIN_CAPABILITIES: u16 = 0x0010;
pub const SPIN_STATUS: u16 = 0x0020;
pub const SPIN_NEXT_BLOCK_STATUS: u16 = 0x0021;
pub const SPOUT_SET_DATA_ENCRYPTION: u16 = 0x0010;

/// AES-GCM with 256 bit key
pub const ALGORITHM_AES_GCM_256: u32 = 0x0001_0014;

const KAD_TYPE_UKAD: u8 = 0x00;
const KAD_TYPE_AKAD: u8 = 0x01;

/// Key and key associated data as stored with each encrypted block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionKey {
    pub key: Vec<u8>,
    pub ukad: Vec<u8>,
    pub akad: Vec<u8>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecryptMode {
    Disabled,
    Raw,
    Decrypt,
    Mixed,
}

impl DecryptMode {
    fn from_raw(value: u8) -> Result<Self, SenseInfo> {
        Ok(match value {
            0 => DecryptMode::Disabled,
            1 => DecryptMode::Raw,
            2 => DecryptMode::Decrypt,
            3 => DecryptMode::Mixed,
            _ => return Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST.parameter_field(7, None)),
        })
    }

    fn to_raw(self) -> u8 {
        match self {
            DecryptMode::Disabled => 0,
            DecryptMode::Raw => 1,
            DecryptMode::Decrypt => 2,
            DecryptMode::Mixed => 3,
        }
    }
}

/// Per drive encryption settings
#[derive(Debug, Clone)]
pub struct EncryptionState {
    pub encrypt: bool,
    pub decrypt: DecryptMode,
    pub key: Option<EncryptionKey>,
    pub algorithm_index: u8,
    pub key_instance_counter: u32,
}

impl Default for EncryptionState {
    fn default() -> Self {
        Self {
            encrypt: false,
            decrypt: DecryptMode::Disabled,
            key: None,
            algorithm_index: 1,
            key_instance_counter: 0,
        }
    }
}

impl EncryptionState {
    /// Key to stamp into newly written blocks
    pub fn write_key(&self) -> Option<&EncryptionKey> {
        if self.encrypt {
            self.key.as_ref()
        } else {
            None
        }
    }

    /// Check if a block with the given key metadata may be read
    ///
    /// Must be called before the position changes, so a failed check
    /// leaves the tape where it was.
    pub fn check_block(&self, block_key: Option<&EncryptionKey>) -> Result<(), SenseInfo> {
        match (block_key, self.decrypt) {
            (Some(_), DecryptMode::Raw) => Ok(()),
            (Some(_), DecryptMode::Disabled) => Err(SenseInfo::UNABLE_TO_DECRYPT),
            (Some(block_key), _) => match self.key {
                None => Err(SenseInfo::UNABLE_TO_DECRYPT),
                Some(ref key) => {
                    if key.key != block_key.key || key.ukad != block_key.ukad {
                        Err(SenseInfo::INCORRECT_KEY)
                    } else {
                        Ok(())
                    }
                }
            },
            (None, DecryptMode::Decrypt) => Err(SenseInfo::UNENCRYPTED_DATA),
            (None, _) => Ok(()),
        }
    }

    pub fn apply(&mut self, request: SetDataEncryption) {
        self.encrypt = request.encrypt;
        self.decrypt = request.decrypt;
        self.algorithm_index = request.algorithm_index;
        if request.key.key.is_empty() {
            self.key = None;
        } else {
            self.key = Some(request.key);
        }
        self.key_instance_counter = self.key_instance_counter.wrapping_add(1);
    }
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspSetDataEncryptionPage {
    page_code: u16,
    page_len: u16,
    scope_byte: u8,
    control_byte_5: u8,
    encryption_mode: u8,
    decryption_mode: u8,
    algorithm_index: u8,
    key_format: u8,
    reserved: [u8; 8],
    key_len: u16,
    /* key follows */
}

#[derive(Endian)]
#[repr(C, packed)]
struct KadDescriptorHeader {
    kad_type: u8,
    flags: u8,
    len: u16,
}

/// Decoded Set Data Encryption page
#[derive(Debug, Clone)]
pub struct SetDataEncryption {
    pub encrypt: bool,
    pub decrypt: DecryptMode,
    pub algorithm_index: u8,
    pub key: EncryptionKey,
}

/// Limits of one encryption algorithm
#[derive(Debug, Copy, Clone)]
pub struct AlgorithmCapability {
    pub algorithm_index: u8,
    pub algorithm_code: u32,
    pub key_size: u16,
    pub max_ukad: u16,
    pub max_akad: u16,
}

/// Decode SPOUT page 0010h
pub fn decode_set_data_encryption(data: &[u8]) -> Result<SetDataEncryption, SenseInfo> {
    let invalid = |byte: u16| SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST.parameter_field(byte, None);

    let mut reader = data;
    let page: SspSetDataEncryptionPage =
        unsafe { reader.read_be_value() }.map_err(|_| SenseInfo::PARAMETER_LIST_LENGTH_ERROR)?;

    if page.page_code != SPOUT_SET_DATA_ENCRYPTION {
        return Err(invalid(0));
    }
    if page.page_len as usize + 4 > data.len() {
        return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR);
    }
    if page.key_format != 0 {
        return Err(invalid(9));
    }

    let encrypt = match page.encryption_mode {
        0 => false,
        2 => true,
        _ => return Err(invalid(6)),
    };
    let decrypt = DecryptMode::from_raw(page.decryption_mode)?;

    let key_len = page.key_len as usize;
    if key_len > reader.len() {
        return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR);
    }
    let mut key = EncryptionKey {
        key: reader[..key_len].to_vec(),
        ..Default::default()
    };
    reader = &reader[key_len..];

    if encrypt && key.key.is_empty() {
        return Err(invalid(18));
    }

    while reader.len() >= 4 {
        let head: KadDescriptorHeader =
            unsafe { reader.read_be_value() }.map_err(|_| SenseInfo::PARAMETER_LIST_LENGTH_ERROR)?;
        let len = head.len as usize;
        if len > reader.len() {
            return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR);
        }
        match head.kad_type {
            KAD_TYPE_UKAD => key.ukad = reader[..len].to_vec(),
            KAD_TYPE_AKAD => key.akad = reader[..len].to_vec(),
            _ => return Err(invalid((data.len() - reader.len() - 4) as u16)),
        }
        reader = &reader[len..];
    }

    Ok(SetDataEncryption {
        encrypt,
        decrypt,
        algorithm_index: page.algorithm_index,
        key,
    })
}

/// SPIN protocol 00h: supported security protocols
pub fn security_protocol_list() -> Vec<u8> {
    vec![0, 0, 0, 0, 0, 0, 0, 2, SECURITY_PROTOCOL_INFO, SECURITY_PROTOCOL_TAPE]
}

/// SPIN page 0000h: supported tape data encryption pages
pub fn supported_pages_page() -> Result<Vec<u8>, Error> {
    let pages = [
        SPIN_SUPPORTED_PAGES,
        SPIN_CAPABILITIES,
        SPIN_SUPPORTED_KEY_FORMATS,
        SPIN_STATUS,
        SPIN_NEXT_BLOCK_STATUS,
    ];
    let mut data = Vec::new();
    unsafe {
        data.write_be_value(SPIN_SUPPORTED_PAGES)?;
        data.write_be_value((pages.len() * 2) as u16)?;
        for page in pages {
            data.write_be_value(page)?;
        }
    }
    Ok(data)
}

/// SPIN page 0011h: only plain text keys
pub fn supported_key_formats_page() -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    unsafe {
        data.write_be_value(SPIN_SUPPORTED_KEY_FORMATS)?;
        data.write_be_value(1u16)?;
    }
    data.push(0x00);
    Ok(data)
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspDataEncryptionCapabilityPage {
    page_code: u16,
    page_len: u16,
    reserved: [u8; 16],
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspDataEncryptionAlgorithmDescriptor {
    algorithm_index: u8,
    reserved1: u8,
    descriptor_len: u16,
    control_byte_4: u8,
    control_byte_5: u8,
    max_ucad_bytes: u16,
    max_acad_bytes: u16,
    key_size: u16,
    control_byte_12: u8,
    reserved2: u8,
    msdk_count: u16,
    reserved3: [u8; 4],
    algorithm_code: u32,
}

/// SPIN page 0010h: data encryption capabilities
///
/// `medium_capable` clears the encrypt/decrypt capable bits for media
/// that cannot hold encrypted data.
pub fn capabilities_page(
    algorithms: &[AlgorithmCapability],
    medium_capable: bool,
) -> Result<Vec<u8>, Error> {
    let descriptor_len = std::mem::size_of::<SspDataEncryptionAlgorithmDescriptor>();
    let page_len = 16 + algorithms.len() * descriptor_len;

    let mut data = Vec::with_capacity(page_len + 4);
    let mut reserved = [0u8; 16];
    reserved[0] = 0x09; // EXTDECC: external data encryption control capable, CFG_P
    let page = SspDataEncryptionCapabilityPage {
        page_code: SPIN_CAPABILITIES,
        page_len: page_len as u16,
        reserved,
    };
    unsafe { data.write_be_value(page)? };

    for algorithm in algorithms {
        // DECRYPT_C and ENCRYPT_C: capable in hardware
        let control_byte_4 = if medium_capable { 0b0000_1010 } else { 0 };
        let descriptor = SspDataEncryptionAlgorithmDescriptor {
            algorithm_index: algorithm.algorithm_index,
            reserved1: 0,
            descriptor_len: (descriptor_len - 4) as u16,
            control_byte_4,
            control_byte_5: 0x20, // UKADF: ukad authenticated
            max_ucad_bytes: algorithm.max_ukad,
            max_acad_bytes: algorithm.max_akad,
            key_size: algorithm.key_size,
            control_byte_12: 0x01, // EAREM: encryption algorithm records encryption mode
            reserved2: 0,
            msdk_count: 0,
            reserved3: [0u8; 4],
            algorithm_code: algorithm.algorithm_code,
        };
        unsafe { data.write_be_value(descriptor)? };
    }

    Ok(data)
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspDataEncryptionStatusPage {
    page_code: u16,
    page_len: u16,
    scope_byte: u8,
    encryption_mode: u8,
    decryption_mode: u8,
    algorithm_index: u8,
    key_instance_counter: u32,
    control_byte: u8,
    key_format: u8,
    key_len: u16,
    reserved: [u8; 8],
}

/// SPIN page 0020h: data encryption status
pub fn status_page(state: &EncryptionState) -> Result<Vec<u8>, Error> {
    let page_len = std::mem::size_of::<SspDataEncryptionStatusPage>() - 4;
    let page = SspDataEncryptionStatusPage {
        page_code: SPIN_STATUS,
        page_len: page_len as u16,
        scope_byte: 0b10 << 5, // all IT nexus
        encryption_mode: if state.encrypt { 2 } else { 0 },
        decryption_mode: state.decrypt.to_raw(),
        algorithm_index: state.algorithm_index,
        key_instance_counter: state.key_instance_counter,
        control_byte: 0,
        key_format: 0,
        key_len: 0, // key is never reported back
        reserved: [0u8; 8],
    };
    let mut data = Vec::with_capacity(page_len + 4);
    unsafe { data.write_be_value(page)? };
    Ok(data)
}

/// Encryption status of the next logical block (page 0021h)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NextBlockStatus {
    /// filemark or end of data
    NotALogicalBlock,
    NotEncrypted,
    Encrypted { key_matches: bool },
}

/// SPIN page 0021h: next block encryption status
pub fn next_block_status_page(
    logical_object_number: u64,
    status: NextBlockStatus,
    algorithm_index: u8,
) -> Result<Vec<u8>, Error> {
    let encryption_status = match status {
        NextBlockStatus::NotALogicalBlock => 0x1,
        NextBlockStatus::NotEncrypted => 0x2,
        NextBlockStatus::Encrypted { key_matches: true } => 0x5,
        NextBlockStatus::Encrypted { key_matches: false } => 0x6,
    };
    let mut data = Vec::with_capacity(16);
    unsafe {
        data.write_be_value(SPIN_NEXT_BLOCK_STATUS)?;
        data.write_be_value(12u16)?;
        data.write_be_value(logical_object_number)?;
    }
    data.push(encryption_status);
    let index = if matches!(status, NextBlockStatus::Encrypted { .. }) {
        algorithm_index
    } else {
        0
    };
    data.extend([index, 0, 0]);
    Ok(data)
}

/// Build a Set Data Encryption page (SPOUT 20h/0010h)
pub fn set_data_encryption_page(
    algorithm_index: u8,
    key: Option<&EncryptionKey>,
    decrypt: DecryptMode,
) -> Result<Vec<u8>, Error> {
    let mut kad = Vec::new();
    if let Some(key) = key {
        for (kad_type, value) in [(KAD_TYPE_UKAD, &key.ukad), (KAD_TYPE_AKAD, &key.akad)] {
            if value.is_empty() {
                continue;
            }
            let head = KadDescriptorHeader {
                kad_type,
                flags: 0,
                len: value.len() as u16,
            };
            unsafe { kad.write_be_value(head)? };
            kad.extend(value);
        }
    }

    let key_len = key.map(|key| key.key.len()).unwrap_or(0);
    let page_len = std::mem::size_of::<SspSetDataEncryptionPage>() - 4 + key_len + kad.len();
    let page = SspSetDataEncryptionPage {
        page_code: SPOUT_SET_DATA_ENCRYPTION,
        page_len: page_len as u16,
        scope_byte: 0b10 << 5,
        control_byte_5: 0,
        encryption_mode: if key.is_some() { 2 } else { 0 },
        decryption_mode: decrypt.to_raw(),
        algorithm_index,
        key_format: 0,
        reserved: [0u8; 8],
        key_len: key_len as u16,
    };

    let mut data = Vec::with_capacity(page_len + 4);
    unsafe { data.write_be_value(page)? };
    if let Some(key) = key {
        data.extend(&key.key);
    }
    data.extend(kad);
    Ok(data)
}

#[cfg(test)]
mod test {
    use anyhow::bail;

    use super::*;

    fn key(byte: u8) -> EncryptionKey {
        EncryptionKey {
            key: vec![byte; 32],
            ukad: b"label".to_vec(),
            akad: Vec::new(),
        }
    }

    #[test]
    fn check_block_key() {
        let mut state = EncryptionState::default();
        let k1 = key(1);
        let k2 = key(2);

        assert_eq!(state.check_block(None), Ok(()));
        assert_eq!(state.check_block(Some(&k1)), Err(SenseInfo::UNABLE_TO_DECRYPT));

        state.decrypt = DecryptMode::Raw;
        assert_eq!(state.check_block(Some(&k1)), Ok(()));

        state.decrypt = DecryptMode::Decrypt;
        state.key = Some(k2);
        assert_eq!(state.check_block(Some(&k1)), Err(SenseInfo::INCORRECT_KEY));
        assert_eq!(state.check_block(None), Err(SenseInfo::UNENCRYPTED_DATA));

        state.decrypt = DecryptMode::Mixed;
        state.key = Some(k1.clone());
        assert_eq!(state.check_block(Some(&k1)), Ok(()));
        assert_eq!(state.check_block(None), Ok(()));

        let mut short = k1.clone();
        short.key.truncate(16);
        assert_eq!(state.check_block(Some(&short)), Err(SenseInfo::INCORRECT_KEY));
    }

    #[test]
    fn set_data_encryption() -> Result<(), Error> {
        let k1 = key(7);
        let data = set_data_encryption_page(1, Some(&k1), DecryptMode::Mixed)?;
        let request = decode_set_data_encryption(&data)?;
        assert!(request.encrypt);
        assert_eq!(request.decrypt, DecryptMode::Mixed);
        assert_eq!(request.key, k1);

        let mut state = EncryptionState::default();
        state.apply(request);
        assert_eq!(state.write_key(), Some(&k1));

        let data = set_data_encryption_page(1, None, DecryptMode::Disabled)?;
        state.apply(decode_set_data_encryption(&data)?);
        assert_eq!(state.write_key(), None);
        assert_eq!(state.key_instance_counter, 2);
        Ok(())
    }

    #[test]
    fn set_data_encryption_invalid() -> Result<(), Error> {
        let mut data = set_data_encryption_page(1, Some(&key(7)), DecryptMode::Decrypt)?;
        data[6] = 1; // unsupported encryption mode
        assert!(decode_set_data_encryption(&data).is_err());
        assert!(decode_set_data_encryption(&data[..10]).is_err());
        Ok(())
    }

    #[test]
    fn status_page_mode() -> Result<(), Error> {
        let mut state = EncryptionState::default();
        state.encrypt = true;
        state.decrypt = DecryptMode::Mixed;

        let data = status_page(&state)?;
        let mut reader = &data[..];
        let page: SspDataEncryptionStatusPage = unsafe { reader.read_be_value()? };
        assert_eq!({ page.page_code }, 0x20);
        assert_eq!((page.encryption_mode, page.decryption_mode), (2, 3));
        Ok(())
    }

    #[test]
    fn capabilities() -> Result<(), Error> {
        let data = capabilities_page(
            &[AlgorithmCapability {
                algorithm_index: 1,
                algorithm_code: ALGORITHM_AES_GCM_256,
                key_size: 32,
                max_ukad: 32,
                max_akad: 12,
            }],
            true,
        )?;

        let mut reader = &data[..];
        let _page: SspDataEncryptionCapabilityPage = unsafe { reader.read_be_value()? };
        let desc: SspDataEncryptionAlgorithmDescriptor = unsafe { reader.read_be_value()? };
        if desc.descriptor_len != 0x14 {
            bail!("got wrong key descriptor len");
        }
        assert_eq!(desc.control_byte_4 & 0b11, 2);
        assert_eq!((desc.control_byte_4 & 0b1100) >> 2, 2);
        assert_eq!({ desc.algorithm_code }, ALGORITHM_AES_GCM_256);
        assert!(reader.is_empty());
        Ok(())
    }
}
