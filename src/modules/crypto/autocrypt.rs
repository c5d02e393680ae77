// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::modules::address::Address;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::raise_error;

/// A peer entry goes stale when its key has not been confirmed for
/// this long; the recommendation degrades to "discouraged".
const STALE_AFTER_MILLIS: i64 = 35 * 24 * 3600 * 1000;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AutocryptAccount {
    pub addr: String,
    pub keyid: String,
    pub keydata: String,
    pub prefer_encrypt: bool,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AutocryptPeer {
    pub addr: String,
    /// When we last saw any mail from this peer.
    pub last_seen: i64,
    /// When we last saw a fresh Autocrypt header from this peer.
    pub autocrypt_timestamp: i64,
    pub keydata: Option<String>,
    pub gossip_keydata: Option<String>,
    pub prefer_encrypt: bool,
}

impl AutocryptPeer {
    pub fn has_any_key(&self) -> bool {
        self.keydata.is_some() || self.gossip_keydata.is_some()
    }

    pub fn gossip_only(&self) -> bool {
        self.keydata.is_none() && self.gossip_keydata.is_some()
    }

    pub fn stale(&self) -> bool {
        self.keydata.is_some() && self.last_seen - self.autocrypt_timestamp > STALE_AFTER_MILLIS
    }
}

/// The persistence seam. The reference store keeps one JSON document
/// per account directory; a SQL engine can be slotted in behind the
/// same trait.
pub trait AutocryptDb {
    fn account(&self, addr: &str) -> Option<AutocryptAccount>;
    fn peer(&self, addr: &str) -> Option<AutocryptPeer>;
    fn upsert_peer(&mut self, peer: AutocryptPeer) -> MailForgeResult<()>;
    fn upsert_account(&mut self, account: AutocryptAccount) -> MailForgeResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    accounts: HashMap<String, AutocryptAccount>,
    peers: HashMap<String, AutocryptPeer>,
}

/// JSON-file backed store under the autocrypt directory.
pub struct JsonAutocryptStore {
    path: PathBuf,
    document: StoreDocument,
}

impl JsonAutocryptStore {
    pub fn open(dir: &Path) -> MailForgeResult<Self> {
        let path = dir.join("autocrypt.json");
        let document = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                raise_error!(
                    format!("Corrupt autocrypt store {:?}: {}", path, e),
                    ErrorCode::InvalidParameter
                )
            })?,
            Err(_) => {
                debug!("Starting empty autocrypt store at {:?}", path);
                StoreDocument::default()
            }
        };
        Ok(JsonAutocryptStore { path, document })
    }

    fn persist(&self) -> MailForgeResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.document).map_err(|e| {
            raise_error!(
                format!("Cannot serialize autocrypt store: {}", e),
                ErrorCode::InternalError
            )
        })?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

impl AutocryptDb for JsonAutocryptStore {
    fn account(&self, addr: &str) -> Option<AutocryptAccount> {
        self.document.accounts.get(&addr.to_ascii_lowercase()).cloned()
    }

    fn peer(&self, addr: &str) -> Option<AutocryptPeer> {
        self.document.peers.get(&addr.to_ascii_lowercase()).cloned()
    }

    fn upsert_peer(&mut self, peer: AutocryptPeer) -> MailForgeResult<()> {
        self.document
            .peers
            .insert(peer.addr.to_ascii_lowercase(), peer);
        self.persist()
    }

    fn upsert_account(&mut self, account: AutocryptAccount) -> MailForgeResult<()> {
        self.document
            .accounts
            .insert(account.addr.to_ascii_lowercase(), account);
        self.persist()
    }
}

/// The five-state recommendation consumed by the compose controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum AutocryptRec {
    Off,
    No,
    Discouraged,
    Available,
    Yes,
}

/// Derive the recommendation for a draft: the worst state across all
/// recipients wins, and `Yes` additionally requires every peer (and
/// the account) to prefer encryption.
pub fn recommendation(
    db: &dyn AutocryptDb,
    from: &str,
    recipients: &[Address],
    feature_enabled: bool,
) -> AutocryptRec {
    if !feature_enabled {
        return AutocryptRec::Off;
    }
    let Some(account) = db.account(from) else {
        return AutocryptRec::Off;
    };
    if !account.enabled {
        return AutocryptRec::Off;
    }

    let mailboxes: Vec<&str> = recipients
        .iter()
        .filter(|a| !a.group && !a.is_group_terminator())
        .filter_map(|a| a.mailbox.as_deref())
        .collect();
    if mailboxes.is_empty() {
        return AutocryptRec::No;
    }

    let mut all_prefer = account.prefer_encrypt;
    let mut discouraged = false;
    for mailbox in mailboxes {
        let Some(peer) = db.peer(mailbox) else {
            return AutocryptRec::No;
        };
        if !peer.has_any_key() {
            return AutocryptRec::No;
        }
        if peer.gossip_only() || peer.stale() {
            discouraged = true;
        }
        all_prefer &= peer.prefer_encrypt;
    }
    if discouraged {
        AutocryptRec::Discouraged
    } else if all_prefer {
        AutocryptRec::Yes
    } else {
        AutocryptRec::Available
    }
}

/// The Autocrypt header advertised on outgoing mail.
pub fn account_header(account: &AutocryptAccount) -> String {
    if account.prefer_encrypt {
        format!(
            "addr={}; prefer-encrypt=mutual; keydata={}",
            account.addr, account.keydata
        )
    } else {
        format!("addr={}; keydata={}", account.addr, account.keydata)
    }
}

/// Fold an incoming header into the peer database. `message_date` is
/// the parsed Date of the carrying message in epoch millis.
pub fn update_peer_from_header(
    db: &mut dyn AutocryptDb,
    from: &str,
    header: &str,
    message_date: i64,
) -> MailForgeResult<()> {
    let mut addr = None;
    let mut keydata = None;
    let mut prefer_encrypt = false;
    for item in header.split(';') {
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        match key.trim() {
            "addr" => addr = Some(value.trim().to_string()),
            "keydata" => keydata = Some(value.trim().to_string()),
            "prefer-encrypt" => prefer_encrypt = value.trim() == "mutual",
            _ => {}
        }
    }
    let Some(addr) = addr else {
        return Ok(());
    };
    // The header only binds to mail actually from that address.
    if !addr.eq_ignore_ascii_case(from) {
        return Ok(());
    }
    let mut peer = db.peer(&addr).unwrap_or(AutocryptPeer {
        addr: addr.clone(),
        ..Default::default()
    });
    if message_date >= peer.autocrypt_timestamp {
        peer.autocrypt_timestamp = message_date;
        peer.keydata = keydata;
        peer.prefer_encrypt = prefer_encrypt;
    }
    peer.last_seen = peer.last_seen.max(message_date);
    db.upsert_peer(peer)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::address::parse_address_list;

    struct MemoryDb {
        accounts: HashMap<String, AutocryptAccount>,
        peers: HashMap<String, AutocryptPeer>,
    }

    impl MemoryDb {
        fn new() -> Self {
            MemoryDb {
                accounts: HashMap::new(),
                peers: HashMap::new(),
            }
        }
    }

    impl AutocryptDb for MemoryDb {
        fn account(&self, addr: &str) -> Option<AutocryptAccount> {
            self.accounts.get(addr).cloned()
        }
        fn peer(&self, addr: &str) -> Option<AutocryptPeer> {
            self.peers.get(addr).cloned()
        }
        fn upsert_peer(&mut self, peer: AutocryptPeer) -> MailForgeResult<()> {
            self.peers.insert(peer.addr.clone(), peer);
            Ok(())
        }
        fn upsert_account(&mut self, account: AutocryptAccount) -> MailForgeResult<()> {
            self.accounts.insert(account.addr.clone(), account);
            Ok(())
        }
    }

    fn db_with_account(prefer: bool) -> MemoryDb {
        let mut db = MemoryDb::new();
        db.upsert_account(AutocryptAccount {
            addr: "me@example.com".into(),
            keyid: "ABCD".into(),
            keydata: "a2V5".into(),
            prefer_encrypt: prefer,
            enabled: true,
        })
        .unwrap();
        db
    }

    fn peer(addr: &str, keyed: bool, prefer: bool) -> AutocryptPeer {
        AutocryptPeer {
            addr: addr.into(),
            last_seen: 1_000,
            autocrypt_timestamp: 1_000,
            keydata: keyed.then(|| "a2V5".to_string()),
            gossip_keydata: None,
            prefer_encrypt: prefer,
        }
    }

    fn recipients(addrs: &str) -> Vec<Address> {
        parse_address_list(addrs).unwrap()
    }

    #[test]
    fn missing_peer_key_means_no() {
        let mut db = db_with_account(true);
        db.upsert_peer(peer("a@x.org", false, false)).unwrap();
        let rec = recommendation(&db, "me@example.com", &recipients("a@x.org"), true);
        assert_eq!(rec, AutocryptRec::No);
    }

    #[test]
    fn mutual_preference_means_yes() {
        let mut db = db_with_account(true);
        db.upsert_peer(peer("a@x.org", true, true)).unwrap();
        db.upsert_peer(peer("b@x.org", true, true)).unwrap();
        let rec = recommendation(&db, "me@example.com", &recipients("a@x.org, b@x.org"), true);
        assert_eq!(rec, AutocryptRec::Yes);
    }

    #[test]
    fn one_nonpreferring_peer_downgrades_to_available() {
        let mut db = db_with_account(true);
        db.upsert_peer(peer("a@x.org", true, true)).unwrap();
        db.upsert_peer(peer("b@x.org", true, false)).unwrap();
        let rec = recommendation(&db, "me@example.com", &recipients("a@x.org, b@x.org"), true);
        assert_eq!(rec, AutocryptRec::Available);
    }

    #[test]
    fn stale_peer_is_discouraged() {
        let mut db = db_with_account(true);
        let mut old = peer("a@x.org", true, true);
        old.last_seen = old.autocrypt_timestamp + STALE_AFTER_MILLIS + 1;
        db.upsert_peer(old).unwrap();
        let rec = recommendation(&db, "me@example.com", &recipients("a@x.org"), true);
        assert_eq!(rec, AutocryptRec::Discouraged);
    }

    #[test]
    fn disabled_feature_is_off() {
        let db = db_with_account(true);
        let rec = recommendation(&db, "me@example.com", &recipients("a@x.org"), false);
        assert_eq!(rec, AutocryptRec::Off);
    }

    #[test]
    fn header_updates_bind_to_sender() {
        let mut db = db_with_account(true);
        update_peer_from_header(
            &mut db,
            "a@x.org",
            "addr=a@x.org; prefer-encrypt=mutual; keydata=a2V5ZGF0YQ==",
            5_000,
        )
        .unwrap();
        let stored = db.peer("a@x.org").unwrap();
        assert!(stored.prefer_encrypt);
        assert_eq!(stored.autocrypt_timestamp, 5_000);

        // A header claiming someone else's address is ignored.
        update_peer_from_header(&mut db, "a@x.org", "addr=evil@x.org; keydata=eA==", 6_000)
            .unwrap();
        assert!(db.peer("evil@x.org").is_none());
    }
}
