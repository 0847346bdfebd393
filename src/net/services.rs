//! Service directory lookups.
//!
//! Servers and clients can be configured with a symbolic service name instead
//! of an explicit port and prompt. A [`ServiceDirectory`] resolves the name;
//! "no such service" is `Ok(None)`, distinct from a failed lookup.

use crate::error::{Error, Result};

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub port: u16,
    pub prompt: Option<String>,
}

impl ServiceEntry {
    /// The configured prompt, or `"<name>>"` when the entry carries none.
    pub fn prompt_or_default(&self) -> String {
        self.prompt
            .clone()
            .unwrap_or_else(|| format!("{}>", self.name))
    }
}

pub trait ServiceDirectory {
    fn lookup(&self, service: &str) -> Result<Option<ServiceEntry>>;
}

/// The system services database (`/etc/services`, via `getservbyname`).
///
/// The prompt is the first alias ending in `>`; without one it is the
/// service name followed by `>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcServices;

impl ServiceDirectory for EtcServices {
    fn lookup(&self, service: &str) -> Result<Option<ServiceEntry>> {
        let name = CString::new(service)
            .map_err(|err| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, err)))?;

        let entry = unsafe { libc::getservbyname(name.as_ptr(), c"tcp".as_ptr()) };
        if entry.is_null() {
            return Ok(None);
        }

        let (official, port, prompt) = unsafe {
            let entry = &*entry;
            let official = CStr::from_ptr(entry.s_name).to_string_lossy().into_owned();
            let port = u16::from_be(entry.s_port as u16);

            let mut prompt = None;
            let mut alias = entry.s_aliases;
            while !alias.is_null() && !(*alias).is_null() {
                let text = CStr::from_ptr(*alias).to_string_lossy();
                if text.ends_with('>') {
                    prompt = Some(text.into_owned());
                    break;
                }
                alias = alias.add(1);
            }

            (official, port, prompt)
        };

        let prompt = prompt.unwrap_or_else(|| format!("{official}>"));

        Ok(Some(ServiceEntry {
            name: official,
            port,
            prompt: Some(prompt),
        }))
    }
}

/// In-memory service table.
#[derive(Debug, Clone, Default)]
pub struct StaticServices {
    entries: HashMap<String, ServiceEntry>,
}

impl StaticServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, port: u16, prompt: Option<&str>) -> Self {
        self.insert(name, port, prompt);
        self
    }

    pub fn insert(&mut self, name: &str, port: u16, prompt: Option<&str>) {
        self.entries.insert(
            name.to_string(),
            ServiceEntry {
                name: name.to_string(),
                port,
                prompt: prompt.map(str::to_string),
            },
        );
    }
}

impl ServiceDirectory for StaticServices {
    fn lookup(&self, service: &str) -> Result<Option<ServiceEntry>> {
        Ok(self.entries.get(service).cloned())
    }
}
