//! Kernel symbol table.
//!
//! The boot contract hands over a textual map, one symbol per line:
//! `address<space>t|T<space>name`. Only text symbols are kept. Lookup
//! resolves an address to the nearest symbol at or below it, for
//! backtraces and panic reports.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

static SYMBOLS: Mutex<Vec<(u32, String)>> = Mutex::new(Vec::new());

/// Parse and install the boot-supplied symbol map. Malformed lines are
/// skipped; the table is sorted by address for binary search.
pub fn load(text: &str) {
    let mut table = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let addr = match fields.next().and_then(|f| u32::from_str_radix(f, 16).ok()) {
            Some(addr) => addr,
            None => continue,
        };
        let kind = fields.next();
        if kind != Some("t") && kind != Some("T") {
            continue;
        }
        let name = match fields.next() {
            Some(name) => name,
            None => continue,
        };
        table.push((addr, String::from(name)));
    }
    table.sort_by_key(|(addr, _)| *addr);
    *SYMBOLS.lock() = table;
}

/// Nearest text symbol at or below `addr`, with the offset into it
pub fn lookup(addr: u32) -> Option<(String, u32)> {
    let table = SYMBOLS.lock();
    let index = match table.binary_search_by_key(&addr, |(a, _)| *a) {
        Ok(i) => i,
        Err(0) => return None,
        Err(i) => i - 1,
    };
    let (base, name) = &table[index];
    Some((name.clone(), addr - base))
}

pub fn count() -> usize {
    SYMBOLS.lock().len()
}
