// ABOUTME: Cipher and key-exchange preference overrides for the russh client config.
// ABOUTME: Maps configured algorithm names onto russh constants, optionally adding legacy ones.

use super::error::{Error, Result};
use russh::{Preferred, cipher, kex};
use std::borrow::Cow;

const CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_128_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
];

const KEX: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_GEX_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G1_SHA1,
];

const LEGACY_CIPHERS: &[cipher::Name] =
    &[cipher::AES_128_CBC, cipher::AES_192_CBC, cipher::AES_256_CBC];

const LEGACY_KEX: &[kex::Name] = &[kex::DH_GEX_SHA1, kex::DH_G1_SHA1];

/// Build the algorithm preferences for one handshake.
///
/// Empty override lists keep russh's defaults. Explicit lists replace them in the given order.
/// `legacy` appends the CBC ciphers and SHA-1 exchanges after whatever list is in effect.
pub(crate) fn preferred(ciphers: &[String], key_exchanges: &[String], legacy: bool) -> Result<Preferred> {
    let defaults = Preferred::default();

    let mut cipher_list: Vec<cipher::Name> = if ciphers.is_empty() {
        defaults.cipher.to_vec()
    } else {
        ciphers
            .iter()
            .map(|name| lookup(CIPHERS, name))
            .collect::<Result<_>>()?
    };

    let mut kex_list: Vec<kex::Name> = if key_exchanges.is_empty() {
        defaults.kex.to_vec()
    } else {
        let mut list = key_exchanges
            .iter()
            .map(|name| lookup(KEX, name))
            .collect::<Result<Vec<_>>>()?;
        // Extension negotiation markers travel in the kex list.
        list.extend(defaults.kex.iter().copied().filter(|name| {
            let name: &str = name.as_ref();
            name.starts_with("ext-info") || name.starts_with("kex-strict")
        }));
        list
    };

    if legacy {
        append_missing(&mut cipher_list, LEGACY_CIPHERS);
        append_missing(&mut kex_list, LEGACY_KEX);
    }

    Ok(Preferred {
        cipher: Cow::Owned(cipher_list),
        kex: Cow::Owned(kex_list),
        ..defaults
    })
}

fn lookup<N: Copy + AsRef<str>>(table: &[N], name: &str) -> Result<N> {
    table
        .iter()
        .copied()
        .find(|candidate| candidate.as_ref() == name)
        .ok_or_else(|| Error::UnsupportedAlgorithm(name.to_string()))
}

fn append_missing<N: Copy + PartialEq>(list: &mut Vec<N>, extra: &[N]) {
    for name in extra {
        if !list.contains(name) {
            list.push(*name);
        }
    }
}
