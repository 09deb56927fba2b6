//! Paged, permission-checked address space for emulating a PE32 image.
//!
//! [`AddressSpace`] maps the sections of a scanned executable onto 4 KiB
//! pages, faults their content in from the scanned file on demand, keeps a
//! small round-robin working set resident and moves modified pages to a
//! scratch file that lives exactly as long as the address space.

pub mod backing;
pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod page;
pub mod section;


pub use cache::{CacheStats, CACHE_SLOTS};
pub use config::VmmConfig;
pub use error::{Result, VmmError};
pub use memory::{Access, AddressSpace};
pub use page::{Permissions, PAGE_SIZE};
pub use section::{ImageHeader, Section, SectionFlags};
