//! Sensitive API category taxonomy

use std::fmt;

use serde::{Deserialize, Serialize};

const DESCRIPTIONS: [&str; 39] = [
    "manipulate the path",
    "read input data from hardware devices",
    "get the path or directory information",
    "get system information",
    "get user information",
    "search for a file",
    "copy or move a file or directory",
    "delete a file or directory",
    "modify the permissions or ownership",
    "create a file or directory",
    "read data from a byte array, or stream",
    "read data from a file",
    "write data to a byte array, or stream",
    "write data to a file",
    "compress data",
    "decompress data",
    "create a writable stream",
    "create a readable stream",
    "open a file",
    "make HTTP request",
    "resolve the DNS",
    "create a network server or communication",
    "send data over the network",
    "receive data over the network",
    "configure the network",
    "get network information",
    "start listening",
    "create a data representation",
    "encode the data",
    "decode the data",
    "create a cipher object",
    "create a decipher object",
    "cipher the data",
    "decipher the data",
    "spawn a new process",
    "run an executable file",
    "execute a command",
    "pipe the data",
    "execute a dynamically created program",
];

/// Categories whose third-party lookups carry the caller's category as a hint.
const INTEREST: [u8; 11] = [6, 7, 9, 10, 17, 18, 19, 20, 22, 31, 32];

/// A sensitive behavior category, numbered 1 to 39.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Category(u8);

impl Category {
    pub const MANIPULATE_PATH: Category = Category(1);
    pub const SYSTEM_INFO: Category = Category(4);
    pub const USER_INFO: Category = Category(5);
    pub const SEARCH_FILE: Category = Category(6);
    pub const DELETE_FILE: Category = Category(8);
    pub const CHANGE_PERMISSIONS: Category = Category(9);
    pub const READ_FILE: Category = Category(12);
    pub const WRITE_FILE: Category = Category(14);
    pub const HTTP_REQUEST: Category = Category(20);
    pub const NETWORK_COMMUNICATION: Category = Category(22);
    pub const SEND_DATA: Category = Category(23);
    pub const RECEIVE_DATA: Category = Category(24);
    pub const DATA_REPRESENTATION: Category = Category(28);
    pub const ENCODE: Category = Category(29);
    pub const DECODE: Category = Category(30);
    pub const SPAWN_PROCESS: Category = Category(35);
    pub const RUN_EXECUTABLE: Category = Category(36);
    pub const EXECUTE_COMMAND: Category = Category(37);
    pub const DYNAMIC_PROGRAM: Category = Category(39);

    pub fn from_id(id: u8) -> Option<Self> {
        (1..=DESCRIPTIONS.len() as u8)
            .contains(&id)
            .then_some(Category(id))
    }

    /// Parses the numeric form used by the knowledge store (`"12"`).
    pub fn parse(value: &str) -> Option<Self> {
        value.trim().parse().ok().and_then(Self::from_id)
    }

    pub fn from_description(description: &str) -> Option<Self> {
        DESCRIPTIONS
            .iter()
            .position(|d| *d == description)
            .map(|i| Category(i as u8 + 1))
    }

    pub fn id(self) -> u8 {
        self.0
    }

    pub fn description(self) -> &'static str {
        DESCRIPTIONS[self.0 as usize - 1]
    }

    pub fn is_interest(self) -> bool {
        INTEREST.contains(&self.0)
    }

    pub fn all() -> impl Iterator<Item = Category> {
        (1..=DESCRIPTIONS.len() as u8).map(Category)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl TryFrom<u8> for Category {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Category::from_id(value).ok_or_else(|| format!("unknown category id {value}"))
    }
}

impl From<Category> for u8 {
    fn from(value: Category) -> Self {
        value.0
    }
}

/// Parses a `-`-separated category list such as `"12-20"`. `Others` and
/// unknown ids yield nothing.
pub fn parse_category_list(value: &str) -> Vec<Category> {
    value.split('-').filter_map(Category::parse).collect()
}

/// First interest category of a list, used as a hint for third-party lookups.
pub fn interest_category(categories: &[Category]) -> Option<Category> {
    categories.iter().copied().find(|c| c.is_interest())
}

/// Maps a factory or constructor full name to the class of the object it
/// returns, so that methods on that object are looked up under the class.
pub fn module_to_class(full_name: &str) -> Option<&'static str> {
    let class = match full_name {
        "Buffer" | "Buffer.alloc" | "Buffer.allocUnsafe" | "Buffer.allocUnsafeSlow"
        | "Buffer.concat" | "Buffer.copyBytesFrom" | "Buffer.from" => "buf",
        "buffer.Blob" | "fs.openAsBlob" => "blob",
        "crypto.createCipheriv" | "crypto.createCipher" => "cipher",
        "crypto.createDecipheriv" | "crypto.createDecipher" => "decipher",
        "crypto.createHash" => "hash",
        "crypto.createHmac" => "hmac",
        "crypto.X509Certificate" => "x509",
        "crypto.createDiffieHellman" => "diffieHellman",
        "fsPromises.open" => "filehandle",
        "fs.opendir" | "fs.opendirSync" | "fsPromises.opendir" => "dir",
        "fs.watch" | "fs.watchFile" => "watcher",
        "fs.createReadStream" => "readStream",
        "fs.stat" | "fs.lstat" | "fs.fstat" => "stats",
        "fs.createWriteStream" => "writeStream",
        "http.request" | "https.request" => "request",
        "http.createServer" | "https.createServer" | "net.createServer" | "tls.createServer" => {
            "server"
        }
        "net.createConnection" | "net.connect" | "net.Socket" | "dgram.createSocket" => "socket",
        "tls.connect" => "tlsSocket",
        "vm.Script" => "script",
        "events.EventEmitter" => "emitter",
        _ => return None,
    };
    Some(class)
}
