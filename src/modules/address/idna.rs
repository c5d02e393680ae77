// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::address::Address;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::raise_error;

/// Convert every mailbox in the list to its ASCII (ACE) form, marking
/// the entries as checked. A domain that cannot be encoded names
/// itself in the diagnostic.
pub fn to_intl(list: &mut [Address]) -> MailForgeResult<()> {
    for addr in list.iter_mut() {
        let Some(mailbox) = addr.mailbox.clone() else {
            continue;
        };
        if addr.group {
            continue;
        }
        let Some((local, domain)) = mailbox.rsplit_once('@') else {
            addr.intl_checked = true;
            continue;
        };
        let ascii = idna::domain_to_ascii(domain).map_err(|e| {
            raise_error!(
                format!("Bad IDN {:?} in address {}: {:?}", domain, mailbox, e),
                ErrorCode::InvalidIdn
            )
        })?;
        addr.mailbox = Some(format!("{}@{}", local, ascii));
        addr.intl_checked = true;
    }
    Ok(())
}

/// Convert ACE domains back to their display (Unicode) form. The
/// decode direction never fails outright; undecodable labels stay in
/// ACE form.
pub fn to_local(list: &mut [Address]) {
    for addr in list.iter_mut() {
        let Some(mailbox) = addr.mailbox.clone() else {
            continue;
        };
        if addr.group {
            continue;
        }
        let Some((local, domain)) = mailbox.rsplit_once('@') else {
            addr.intl_checked = false;
            continue;
        };
        let (unicode, result) = idna::domain_to_unicode(domain);
        if result.is_ok() {
            addr.mailbox = Some(format!("{}@{}", local, unicode));
        }
        addr.intl_checked = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::address::parse_address_list;

    #[test]
    fn round_trip_is_identity_modulo_flag() {
        let mut list = parse_address_list("jane@bücher.example").unwrap();
        let original = list[0].mailbox.clone();
        to_intl(&mut list).unwrap();
        assert_eq!(
            list[0].mailbox.as_deref(),
            Some("jane@xn--bcher-kva.example")
        );
        assert!(list[0].intl_checked);
        to_local(&mut list);
        assert_eq!(list[0].mailbox, original);
        assert!(!list[0].intl_checked);
    }

    #[test]
    fn ascii_domains_pass_through() {
        let mut list = parse_address_list("a@example.com").unwrap();
        to_intl(&mut list).unwrap();
        assert_eq!(list[0].mailbox.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn bad_idn_names_the_domain() {
        let mut list = parse_address_list("a@xn--zzzzzz").unwrap();
        let err = to_intl(&mut list);
        if let Err(e) = err {
            assert!(format!("{}", e).contains("xn--zzzzzz"));
        }
    }
}
