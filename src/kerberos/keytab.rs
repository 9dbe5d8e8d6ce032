use std::path::{Path, PathBuf};

use tracing::debug;
use zeroize::Zeroizing;

use crate::error::Error;

const KEYTAB_FIRST_BYTE: u8 = 0x05;
const KEYTAB_VERSION_2: u8 = 0x02;

/// One key of an MIT keytab.
#[derive(Clone)]
pub struct KeytabEntry {
    pub components: Vec<String>,
    pub realm: String,
    pub name_type: u32,
    pub timestamp: u32,
    pub kvno: u32,
    pub enctype: u16,
    key: Zeroizing<Vec<u8>>,
}

impl KeytabEntry {
    /// `primary/instance@REALM`.
    pub fn principal(&self) -> String {
        format!("{}@{}", self.components.join("/"), self.realm)
    }

    pub fn key_len(&self) -> usize {
        self.key.len()
    }
}

impl std::fmt::Debug for KeytabEntry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("KeytabEntry")
            .field("principal", &self.principal())
            .field("name_type", &self.name_type)
            .field("timestamp", &self.timestamp)
            .field("kvno", &self.kvno)
            .field("enctype", &self.enctype)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// MIT keytab, file format version `0x0502`.
#[derive(Clone, Debug)]
pub struct Keytab {
    path: PathBuf,
    entries: Vec<KeytabEntry>,
}

impl Keytab {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| Error::KeytabLoad {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;
        let keytab = Self::parse(path, &bytes)?;
        debug!(
            path = %path.display(),
            entries = keytab.entries.len(),
            "loaded keytab"
        );
        Ok(keytab)
    }

    pub fn parse(path: &Path, bytes: &[u8]) -> crate::Result<Self> {
        let fail = |message: String| Error::KeytabLoad {
            path: path.to_path_buf(),
            message,
        };

        match bytes {
            [KEYTAB_FIRST_BYTE, KEYTAB_VERSION_2, ..] => {}
            [KEYTAB_FIRST_BYTE, version, ..] => {
                return Err(fail(format!("unsupported keytab version 0x05{version:02x}")));
            }
            _ => return Err(fail("not a keytab file".to_owned())),
        }

        let mut reader = Reader::new(&bytes[2..]);
        let mut entries = Vec::new();
        while !reader.is_empty() {
            let size = reader.i32().map_err(&fail)?;
            if size == 0 {
                break;
            }
            if size < 0 {
                reader.skip(size.unsigned_abs() as usize).map_err(&fail)?;
                continue;
            }
            let record = reader.take(size as usize).map_err(&fail)?;
            entries.push(parse_entry(record).map_err(&fail)?);
        }

        if entries.is_empty() {
            return Err(fail("keytab contains no entries".to_owned()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[KeytabEntry] {
        &self.entries
    }

    /// First entry for `name@REALM`. Names match exactly, realms ignore
    /// ASCII case.
    pub fn entry_for(&self, principal: &str) -> Option<&KeytabEntry> {
        let (name, realm) = principal.rsplit_once('@').unwrap_or((principal, ""));
        self.entries.iter().find(|entry| {
            entry.realm.eq_ignore_ascii_case(realm) && entry.components.join("/") == name
        })
    }

    pub fn contains_principal(&self, principal: &str) -> bool {
        self.entry_for(principal).is_some()
    }
}

fn parse_entry(record: &[u8]) -> Result<KeytabEntry, String> {
    let mut reader = Reader::new(record);
    let component_count = reader.u16()?;
    let realm = reader.counted_string()?;
    let mut components = Vec::with_capacity(usize::from(component_count));
    for _ in 0..component_count {
        components.push(reader.counted_string()?);
    }
    let name_type = reader.u32()?;
    let timestamp = reader.u32()?;
    let kvno8 = reader.u8()?;
    let enctype = reader.u16()?;
    let key_len = reader.u16()?;
    let key = Zeroizing::new(reader.take(usize::from(key_len))?.to_vec());

    // Newer writers append the full 32-bit kvno; zero means "use the 8-bit one".
    let kvno = match reader.remaining() {
        remaining if remaining >= 4 => match reader.u32()? {
            0 => u32::from(kvno8),
            kvno => kvno,
        },
        _ => u32::from(kvno8),
    };

    Ok(KeytabEntry {
        components,
        realm,
        name_type,
        timestamp,
        kvno,
        enctype,
        key,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        if self.bytes.len() < len {
            return Err(format!(
                "truncated keytab: wanted {len} bytes, {} left",
                self.bytes.len()
            ));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn skip(&mut self, len: usize) -> Result<(), String> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, String> {
        self.u32().map(|value| value as i32)
    }

    fn counted_string(&mut self) -> Result<String, String> {
        let len = self.u16()?;
        let bytes = self.take(usize::from(len))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "principal is not valid utf-8".to_owned())
    }
}
