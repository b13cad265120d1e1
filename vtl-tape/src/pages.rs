//! Mode, log and VPD page registry
//!
//! Pages are kept in insertion order, which is also the order used
//! when all pages are reported. There is at most one page per
//! (kind, page code, sub page code).

use anyhow::{bail, Error};

use crate::sense::SenseInfo;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageKind {
    Mode,
    Log,
    Vpd,
}

/// Page control field of MODE SENSE / LOG SENSE
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageControl {
    Current,
    Changeable,
    Default,
    Saved,
}

impl PageControl {
    /// Decode the PC field of a MODE SENSE cdb (byte 2, bits 7-6)
    pub fn from_mode_sense(byte: u8) -> Self {
        match byte >> 6 {
            0 => PageControl::Current,
            1 => PageControl::Changeable,
            2 => PageControl::Default,
            _ => PageControl::Saved,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    kind: PageKind,
    page_code: u8,
    sub_page_code: u8,
    data: Vec<u8>,
    changeable: Option<Vec<u8>>,
    default: Option<Vec<u8>>,
}

impl Page {
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn page_code(&self) -> u8 {
        self.page_code
    }

    pub fn sub_page_code(&self) -> u8 {
        self.sub_page_code
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the page contents
    ///
    /// Pages reported with a length field (log pages, VPD pages) change
    /// size at runtime. A changeable mask of different size is dropped.
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        if matches!(self.changeable, Some(ref mask) if mask.len() != self.data.len()) {
            self.changeable = None;
        }
    }

    pub fn set_changeable(&mut self, mask: &[u8]) -> Result<(), Error> {
        if mask.len() != self.data.len() {
            bail!(
                "changeable mask length {} does not match page length {}",
                mask.len(),
                self.data.len()
            );
        }
        self.changeable = Some(mask.to_vec());
        Ok(())
    }

    pub fn changeable(&self) -> Option<&[u8]> {
        self.changeable.as_deref()
    }

    /// Remember the current contents as the default values
    pub fn snapshot_default(&mut self) {
        self.default = Some(self.data.clone());
    }

    /// Restore the default values (if a snapshot exists)
    pub fn restore_default(&mut self) {
        if let Some(ref default) = self.default {
            self.data = default.clone();
        }
    }

    /// Serialize the page for the given page control
    ///
    /// Saved values must be rejected by the caller before.
    pub fn serialize(&self, control: PageControl) -> &[u8] {
        match control {
            PageControl::Current | PageControl::Saved => &self.data,
            PageControl::Changeable => self.changeable.as_deref().unwrap_or(&self.data),
            PageControl::Default => self.default.as_deref().unwrap_or(&self.data),
        }
    }
}

/// Page storage could not be allocated
///
/// The unit cannot continue without its pages, so the command loop treats
/// this as fatal.
#[derive(thiserror::Error, Debug)]
#[error("unable to allocate {what} - {reason}")]
pub struct PageAllocationError {
    what: String,
    reason: String,
}

/// Keyed page store owned by one logical unit
#[derive(Default)]
pub struct PageRegistry {
    pages: Vec<Page>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn position(&self, kind: PageKind, page_code: u8, sub_page_code: u8) -> Option<usize> {
        self.pages.iter().position(|page| {
            page.kind == kind && page.page_code == page_code && page.sub_page_code == sub_page_code
        })
    }

    /// Exact match lookup (no wildcards)
    pub fn lookup(&self, kind: PageKind, page_code: u8, sub_page_code: u8) -> Option<&Page> {
        self.position(kind, page_code, sub_page_code)
            .map(|index| &self.pages[index])
    }

    pub fn lookup_mut(
        &mut self,
        kind: PageKind,
        page_code: u8,
        sub_page_code: u8,
    ) -> Option<&mut Page> {
        self.position(kind, page_code, sub_page_code)
            .map(move |index| &mut self.pages[index])
    }

    /// Allocate a zero filled page
    ///
    /// An existing page with the same key is replaced in place (keeping
    /// its report position), never duplicated.
    pub fn allocate(
        &mut self,
        kind: PageKind,
        page_code: u8,
        sub_page_code: u8,
        size: usize,
    ) -> Result<&mut Page, Error> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|err| PageAllocationError {
            what: format!("page {:02x}h/{:02x}h", page_code, sub_page_code),
            reason: err.to_string(),
        })?;
        data.resize(size, 0);

        let page = Page {
            kind,
            page_code,
            sub_page_code,
            data,
            changeable: None,
            default: None,
        };

        let index = match self.position(kind, page_code, sub_page_code) {
            Some(index) => {
                self.pages[index] = page;
                index
            }
            None => {
                self.pages.try_reserve(1).map_err(|err| PageAllocationError {
                    what: String::from("page registry"),
                    reason: err.to_string(),
                })?;
                self.pages.push(page);
                self.pages.len() - 1
            }
        };

        Ok(&mut self.pages[index])
    }

    /// Allocate a page and fill it with `data`
    pub fn add(
        &mut self,
        kind: PageKind,
        page_code: u8,
        sub_page_code: u8,
        data: &[u8],
    ) -> Result<&mut Page, Error> {
        let page = self.allocate(kind, page_code, sub_page_code, data.len())?;
        page.data_mut().copy_from_slice(data);
        Ok(page)
    }

    pub fn remove(&mut self, kind: PageKind, page_code: u8, sub_page_code: u8) -> Option<Page> {
        self.position(kind, page_code, sub_page_code)
            .map(|index| self.pages.remove(index))
    }

    /// Iterate pages of one kind in report order
    pub fn iter(&self, kind: PageKind) -> impl Iterator<Item = &Page> {
        self.pages.iter().filter(move |page| page.kind == kind)
    }

    /// All sub pages of a page code, in report order
    pub fn sub_pages(&self, kind: PageKind, page_code: u8) -> impl Iterator<Item = &Page> {
        self.iter(kind)
            .filter(move |page| page.page_code == page_code)
    }

    /// Take default snapshots of all mode pages
    pub fn snapshot_defaults(&mut self) {
        for page in self.pages.iter_mut() {
            page.snapshot_default();
        }
    }

    /// Serialize a page, rejecting saved values
    pub fn serialize(&self, page: &Page, control: PageControl) -> Result<Vec<u8>, SenseInfo> {
        if control == PageControl::Saved {
            return Err(SenseInfo::SAVING_PARAMETERS_UNSUPPORTED);
        }
        Ok(page.serialize(control).to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_replaces() -> Result<(), Error> {
        let mut registry = PageRegistry::new();

        for (kind, code, sub) in [
            (PageKind::Mode, 0x0f, 0x00),
            (PageKind::Mode, 0x10, 0x00),
            (PageKind::Mode, 0x10, 0x01),
            (PageKind::Log, 0x0f, 0x00),
            (PageKind::Vpd, 0x80, 0x00),
        ] {
            registry.allocate(kind, code, sub, 8)?;
            let page = registry.lookup(kind, code, sub).unwrap();
            assert_eq!(page.kind(), kind);
            assert_eq!(page.page_code(), code);
            assert_eq!(page.sub_page_code(), sub);
        }
        assert_eq!(registry.len(), 5);

        registry.lookup_mut(PageKind::Mode, 0x10, 0x00).unwrap().data_mut()[0] = 0xaa;
        let page = registry.allocate(PageKind::Mode, 0x10, 0x00, 4)?;
        assert_eq!(page.data(), &[0u8; 4]);
        assert_eq!(registry.len(), 5);

        // report order unchanged
        let codes: Vec<(u8, u8)> = registry
            .iter(PageKind::Mode)
            .map(|page| (page.page_code(), page.sub_page_code()))
            .collect();
        assert_eq!(codes, vec![(0x0f, 0), (0x10, 0), (0x10, 1)]);
        Ok(())
    }

    #[test]
    fn lookup_is_exact() -> Result<(), Error> {
        let mut registry = PageRegistry::new();
        registry.allocate(PageKind::Mode, 0x0a, 0x00, 12)?;
        assert!(registry.lookup(PageKind::Mode, 0x0a, 0xff).is_none());
        assert!(registry.lookup(PageKind::Mode, 0x3f, 0x00).is_none());
        assert!(registry.lookup(PageKind::Log, 0x0a, 0x00).is_none());
        Ok(())
    }

    #[test]
    fn page_control() -> Result<(), Error> {
        let mut registry = PageRegistry::new();
        let page = registry.add(PageKind::Mode, 0x0f, 0x00, &[0x0f, 0x02, 0x80, 0x00])?;
        page.snapshot_default();
        page.data_mut()[3] = 0x11;

        let page = registry.lookup(PageKind::Mode, 0x0f, 0x00).unwrap();
        // no mask registered: changeable falls back to the data
        assert_eq!(
            registry.serialize(page, PageControl::Changeable)?,
            vec![0x0f, 0x02, 0x80, 0x11]
        );
        assert_eq!(
            registry.serialize(page, PageControl::Default)?,
            vec![0x0f, 0x02, 0x80, 0x00]
        );
        assert_eq!(
            registry.serialize(page, PageControl::Saved),
            Err(SenseInfo::SAVING_PARAMETERS_UNSUPPORTED)
        );

        let page = registry.lookup_mut(PageKind::Mode, 0x0f, 0x00).unwrap();
        page.set_changeable(&[0, 0, 0xc0, 0])?;
        assert!(page.set_changeable(&[0]).is_err());
        let page = registry.lookup(PageKind::Mode, 0x0f, 0x00).unwrap();
        assert_eq!(
            registry.serialize(page, PageControl::Changeable)?,
            vec![0, 0, 0xc0, 0]
        );
        Ok(())
    }
}
