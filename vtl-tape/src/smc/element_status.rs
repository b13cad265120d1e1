//! READ ELEMENT STATUS (B8h) response
//!
//! The response has an 8 byte header, followed by one element status
//! page per run of elements of the same type. Each page starts with a
//! sub header and holds fixed size descriptors.

use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::WriteExt;

use crate::sense::{ScsiError, SenseInfo};

use super::{ElementId, ElementType, Library};

pub const SCSI_VOLUME_TAG_LEN: usize = 36;

/// Vendor (8), product (16) and serial number (10)
const DVCID_IDENTIFIER_LEN: usize = 34;

#[repr(C, packed)]
#[derive(Endian)]
struct ElementStatusHeader {
    first_element_address_reported: u16,
    number_of_elements_available: u16,
    reserved: u8,
    byte_count_of_report_available: [u8; 3],
}

#[repr(C, packed)]
#[derive(Endian)]
struct SubHeader {
    element_type_code: u8,
    flags: u8,
    descriptor_length: u16,
    reserved: u8,
    byte_count_of_descriptor_data_available: [u8; 3],
}

#[repr(C, packed)]
#[derive(Endian)]
struct TransportDescriptor {
    element_address: u16,
    flags1: u8,
    reserved_3: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    reserved_6: [u8; 3],
    flags2: u8,
    source_storage_element_address: u16,
}

#[repr(C, packed)]
#[derive(Endian)]
struct TransferDescriptor {
    element_address: u16,
    flags1: u8,
    reserved_3: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    id_valid: u8,
    scsi_bus_address: u8,
    reserved_8: u8,
    flags2: u8,
    source_storage_element_address: u16,
}

#[repr(C, packed)]
#[derive(Endian)]
struct StorageDescriptor {
    element_address: u16,
    flags1: u8,
    reserved_3: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    reserved_6: [u8; 3],
    flags2: u8,
    source_storage_element_address: u16,
}

#[repr(C, packed)]
#[derive(Endian)]
struct DvcidHead {
    code_set: u8,
    identifier_type: u8,
    reserved: u8,
    identifier_len: u8,
}

const DESCRIPTOR_LEN: usize = 12;

// flags1
const FULL: u8 = 0x01;
const IMP_EXP: u8 = 0x02;
const ACCESS: u8 = 0x08;
const EX_ENAB: u8 = 0x10;
const IN_ENAB: u8 = 0x20;

// flags2
const SVALID: u8 = 0x80;

// sub header flags
const PVOLTAG: u8 = 0x80;

/// Decoded READ ELEMENT STATUS CDB
#[derive(Debug, Clone, Copy)]
pub struct ElementStatusRequest {
    /// `None` reports all element types
    pub element_type: Option<ElementType>,
    pub start: u16,
    pub count: u16,
    pub volume_tag: bool,
    pub dvcid: bool,
}

fn be_u24(value: usize) -> [u8; 3] {
    let bytes = (value as u32).to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

fn volume_tag(barcode: Option<&str>) -> Vec<u8> {
    match barcode {
        Some(barcode) => {
            let mut tag = crate::scsi_ascii(barcode, 32);
            tag.extend([0u8; 4]); // reserved, volume sequence number
            tag
        }
        None => vec![0u8; SCSI_VOLUME_TAG_LEN],
    }
}

fn encode_descriptor(
    data: &mut Vec<u8>,
    library: &Library,
    id: ElementId,
    request: &ElementStatusRequest,
) -> Result<(), Error> {
    let element_address = library.address_of(id);
    let cartridge = library.cartridge(id);
    let full = if cartridge.is_some() { FULL } else { 0 };
    let (flags2, source_storage_element_address) = match cartridge.and_then(|c| c.source) {
        Some(source) => (SVALID, source),
        None => (0, 0),
    };

    match id.element_type {
        ElementType::Transport => {
            let desc = TransportDescriptor {
                element_address,
                flags1: full,
                reserved_3: 0,
                additional_sense_code: 0,
                additional_sense_code_qualifier: 0,
                reserved_6: [0u8; 3],
                flags2,
                source_storage_element_address,
            };
            unsafe { data.write_be_value(desc)? };
        }
        ElementType::Storage | ElementType::ImportExport => {
            let mut flags1 = full;
            if id.element_type == ElementType::ImportExport {
                flags1 |= IN_ENAB | EX_ENAB;
                if !library.map_open {
                    flags1 |= ACCESS;
                }
                // placed by the operator, not by the transport
                if cartridge.map(|c| c.source.is_none()).unwrap_or(false) {
                    flags1 |= IMP_EXP;
                }
            } else {
                flags1 |= ACCESS;
            }
            let desc = StorageDescriptor {
                element_address,
                flags1,
                reserved_3: 0,
                additional_sense_code: 0,
                additional_sense_code_qualifier: 0,
                reserved_6: [0u8; 3],
                flags2,
                source_storage_element_address,
            };
            unsafe { data.write_be_value(desc)? };
        }
        ElementType::DataTransfer => {
            let desc = TransferDescriptor {
                element_address,
                flags1: full | ACCESS,
                reserved_3: 0,
                additional_sense_code: 0,
                additional_sense_code_qualifier: 0,
                id_valid: 0,
                scsi_bus_address: 0,
                reserved_8: 0,
                flags2,
                source_storage_element_address,
            };
            unsafe { data.write_be_value(desc)? };
        }
    }

    if request.volume_tag {
        data.extend(volume_tag(cartridge.map(|c| c.barcode.as_str())));
    }

    if request.dvcid && id.element_type == ElementType::DataTransfer {
        let drive = &library.drives()[id.index];
        let head = DvcidHead {
            code_set: 2, // ASCII
            identifier_type: 1, // T10 vendor identification
            reserved: 0,
            identifier_len: DVCID_IDENTIFIER_LEN as u8,
        };
        unsafe { data.write_be_value(head)? };
        data.extend(crate::scsi_ascii(&drive.vendor, 8));
        data.extend(crate::scsi_ascii(&drive.product, 16));
        data.extend(crate::scsi_ascii(&drive.serial, 10));
    }

    Ok(())
}

fn element_status_page(
    library: &Library,
    elements: &[ElementId],
    request: &ElementStatusRequest,
) -> Result<Vec<u8>, Error> {
    let element_type = elements[0].element_type;

    let mut descriptor_length = DESCRIPTOR_LEN;
    if request.volume_tag {
        descriptor_length += SCSI_VOLUME_TAG_LEN;
    }
    if request.dvcid && element_type == ElementType::DataTransfer {
        descriptor_length += 4 + DVCID_IDENTIFIER_LEN;
    }

    let mut descriptors = Vec::with_capacity(descriptor_length * elements.len());
    for id in elements {
        encode_descriptor(&mut descriptors, library, *id, request)?;
    }

    let head = SubHeader {
        element_type_code: element_type.code(),
        flags: if request.volume_tag { PVOLTAG } else { 0 },
        descriptor_length: descriptor_length as u16,
        reserved: 0,
        byte_count_of_descriptor_data_available: be_u24(descriptors.len()),
    };

    let mut data = Vec::with_capacity(8 + descriptors.len());
    unsafe { data.write_be_value(head)? };
    data.extend(descriptors);
    Ok(data)
}

/// Build the complete (untruncated) element status data
pub fn read_element_status(
    library: &Library,
    request: &ElementStatusRequest,
) -> Result<Vec<u8>, ScsiError> {
    let elements = library.elements();

    let highest = elements.last().map(|id| library.address_of(*id)).unwrap_or(0);
    if request.start > highest {
        return Err(SenseInfo::INVALID_ELEMENT_ADDRESS.cdb_field(2, None).into());
    }

    let selected: Vec<ElementId> = elements
        .into_iter()
        .filter(|id| match request.element_type {
            Some(element_type) => id.element_type == element_type,
            None => true,
        })
        .filter(|id| library.address_of(*id) >= request.start)
        .take(request.count as usize)
        .collect();

    let mut body = Vec::new();
    let mut first = 0;
    while first < selected.len() {
        let element_type = selected[first].element_type;
        let end = selected[first..]
            .iter()
            .position(|id| id.element_type != element_type)
            .map(|len| first + len)
            .unwrap_or(selected.len());
        body.extend(element_status_page(library, &selected[first..end], request)?);
        first = end;
    }

    let head = ElementStatusHeader {
        first_element_address_reported: selected
            .first()
            .map(|id| library.address_of(*id))
            .unwrap_or(0),
        number_of_elements_available: selected.len() as u16,
        reserved: 0,
        byte_count_of_report_available: be_u24(body.len()),
    };

    let mut data = Vec::with_capacity(8 + body.len());
    unsafe { data.write_be_value(head)? };
    data.extend(body);
    Ok(data)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::smc::test::{test_library, RecordingControl};

    fn request(element_type: Option<ElementType>) -> ElementStatusRequest {
        ElementStatusRequest {
            element_type,
            start: 0,
            count: 0xffff,
            volume_tag: true,
            dvcid: false,
        }
    }

    #[test]
    fn storage_with_volume_tags() -> Result<(), Error> {
        let control = RecordingControl::default();
        let library = test_library(&control);

        let data = read_element_status(&library, &request(Some(ElementType::Storage)))?;

        // header: first 03E8h, 8 elements
        assert_eq!(&data[0..4], &[0x03, 0xe8, 0x00, 0x08]);
        let descriptor_len = 12 + SCSI_VOLUME_TAG_LEN;
        assert_eq!(data.len(), 8 + 8 + 8 * descriptor_len);

        // sub header
        assert_eq!(data[8], 2);
        assert_eq!(data[9], PVOLTAG);
        assert_eq!(u16::from_be_bytes([data[10], data[11]]) as usize, descriptor_len);

        let first = &data[16..16 + descriptor_len];
        assert_eq!(first[2], FULL | ACCESS);
        assert_eq!(&first[12..20], b"E01001L6");
        assert_eq!(first[20], b' ');

        let third = &data[16 + 2 * descriptor_len..16 + 3 * descriptor_len];
        assert_eq!(third[2], ACCESS);
        assert!(third[12..].iter().all(|b| *b == 0));

        Ok(())
    }

    #[test]
    fn drive_identifiers() -> Result<(), Error> {
        let control = RecordingControl::default();
        let mut library = test_library(&control);
        let slot = library.locate(0x03e8).unwrap();
        let drive = library.locate(0x01f4).unwrap();
        library.move_medium(slot, drive)?;

        let mut req = request(Some(ElementType::DataTransfer));
        req.dvcid = true;
        let data = read_element_status(&library, &req)?;

        let descriptor_len = 12 + SCSI_VOLUME_TAG_LEN + 4 + DVCID_IDENTIFIER_LEN;
        assert_eq!(data.len(), 16 + 2 * descriptor_len);

        let drive = &data[16..16 + descriptor_len];
        assert_eq!(&drive[0..2], &[0x01, 0xf4]);
        assert_eq!(drive[2] & FULL, FULL);
        assert_eq!(drive[9], SVALID);
        assert_eq!(&drive[10..12], &[0x03, 0xe8]);
        assert_eq!(&drive[12..20], b"E01001L6");
        assert_eq!(&drive[48..52], &[2, 1, 0, 34]);
        assert_eq!(&drive[52..60], b"IBM     ");
        assert_eq!(&drive[60..71], b"ULT3580-TD6");
        assert_eq!(&drive[76..84], b"XYZZY_A1");

        Ok(())
    }

    #[test]
    fn mixed_types_and_ranges() -> Result<(), Error> {
        let control = RecordingControl::default();
        let library = test_library(&control);

        let mut req = request(None);
        req.volume_tag = false;
        req.start = 0x0011;
        req.count = 3;
        let data = read_element_status(&library, &req)?;

        // one import/export slot, then two drives
        assert_eq!(&data[0..4], &[0x00, 0x11, 0x00, 0x03]);
        assert_eq!(data[8], 3);
        assert_eq!(data[16 + 12], 4);
        assert_eq!(data.len(), 8 + (8 + 12) + (8 + 2 * 12));

        req.start = 0x0400;
        assert!(read_element_status(&library, &req).is_err());

        req.start = 0;
        req.count = 0;
        let data = read_element_status(&library, &req)?;
        assert_eq!(data, vec![0, 0, 0, 0, 0, 0, 0, 0]);

        Ok(())
    }
}
