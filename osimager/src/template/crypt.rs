//! Classic Unix `crypt` password hashing: MD5-crypt (`$1$`), SHA-256-crypt
//! (`$5$`), and SHA-512-crypt (`$6$`).
//!
//! These are deterministic functions of (salt, password) reimplemented from
//! the published algorithms, so installer files can carry pre-hashed root
//! passwords without shelling out to the host's crypt(3).  SHA variants use
//! the default 5000 rounds and do not emit a `rounds=` parameter.

use md5::Md5;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256, Sha512};

/// The crypt base64 alphabet; note this is not RFC 4648 base64.
const ITOA64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const MD5_SALT_MAX: usize = 8;
const SHA_SALT_MAX: usize = 16;
const SHA_ROUNDS: usize = 5000;

/// Generates a random salt of the given length from the crypt alphabet.
pub fn random_salt(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| *ITOA64.choose(&mut rng).unwrap() as char)
        .collect()
}

/// MD5-crypt hash of `password` with a random salt.
pub fn md5_crypt(password: &str) -> String {
    md5_crypt_salted(password, &random_salt(MD5_SALT_MAX))
}

/// SHA-256-crypt hash of `password` with a random salt.
pub fn sha256_crypt(password: &str) -> String {
    sha256_crypt_salted(password, &random_salt(SHA_SALT_MAX))
}

/// SHA-512-crypt hash of `password` with a random salt.
pub fn sha512_crypt(password: &str) -> String {
    sha512_crypt_salted(password, &random_salt(SHA_SALT_MAX))
}

/// Salts are at most 8 (MD5) or 16 (SHA) characters and stop at a '$'.
fn clean_salt(salt: &str, max: usize) -> &str {
    let salt = salt.split('$').next().unwrap_or("");
    match salt.char_indices().nth(max) {
        Some((idx, _)) => &salt[..idx],
        None => salt,
    }
}

pub fn md5_crypt_salted(password: &str, salt: &str) -> String {
    let salt = clean_salt(salt, MD5_SALT_MAX);
    let pw = password.as_bytes();
    let sl = salt.as_bytes();

    let mut ctx = Md5::new();
    ctx.update(pw);
    ctx.update(b"$1$");
    ctx.update(sl);

    let mut alt = Md5::new();
    alt.update(pw);
    alt.update(sl);
    alt.update(pw);
    let alt = alt.finalize();

    let mut cnt = pw.len();
    while cnt > 16 {
        ctx.update(&alt);
        cnt -= 16;
    }
    ctx.update(&alt[..cnt]);

    let mut cnt = pw.len();
    while cnt > 0 {
        if cnt & 1 != 0 {
            ctx.update([0u8]);
        } else {
            ctx.update(&pw[..1]);
        }
        cnt >>= 1;
    }
    let mut last = ctx.finalize().to_vec();

    // The slowdown loop from the original algorithm.
    for i in 0..1000 {
        let mut ctx = Md5::new();
        if i & 1 != 0 {
            ctx.update(pw);
        } else {
            ctx.update(&last);
        }
        if i % 3 != 0 {
            ctx.update(sl);
        }
        if i % 7 != 0 {
            ctx.update(pw);
        }
        if i & 1 != 0 {
            ctx.update(&last);
        } else {
            ctx.update(pw);
        }
        last = ctx.finalize().to_vec();
    }

    let mut out = String::with_capacity(22);
    b64_from_24bit(last[0], last[6], last[12], 4, &mut out);
    b64_from_24bit(last[1], last[7], last[13], 4, &mut out);
    b64_from_24bit(last[2], last[8], last[14], 4, &mut out);
    b64_from_24bit(last[3], last[9], last[15], 4, &mut out);
    b64_from_24bit(last[4], last[10], last[5], 4, &mut out);
    b64_from_24bit(0, 0, last[11], 2, &mut out);

    format!("$1${}${}", salt, out)
}

pub fn sha256_crypt_salted(password: &str, salt: &str) -> String {
    let salt = clean_salt(salt, SHA_SALT_MAX);
    let c = sha_crypt::<Sha256>(password.as_bytes(), salt.as_bytes(), 32);

    let mut out = String::with_capacity(43);
    b64_from_24bit(c[0], c[10], c[20], 4, &mut out);
    b64_from_24bit(c[21], c[1], c[11], 4, &mut out);
    b64_from_24bit(c[12], c[22], c[2], 4, &mut out);
    b64_from_24bit(c[3], c[13], c[23], 4, &mut out);
    b64_from_24bit(c[24], c[4], c[14], 4, &mut out);
    b64_from_24bit(c[15], c[25], c[5], 4, &mut out);
    b64_from_24bit(c[6], c[16], c[26], 4, &mut out);
    b64_from_24bit(c[27], c[7], c[17], 4, &mut out);
    b64_from_24bit(c[18], c[28], c[8], 4, &mut out);
    b64_from_24bit(c[9], c[19], c[29], 4, &mut out);
    b64_from_24bit(0, c[31], c[30], 3, &mut out);

    format!("$5${}${}", salt, out)
}

pub fn sha512_crypt_salted(password: &str, salt: &str) -> String {
    let salt = clean_salt(salt, SHA_SALT_MAX);
    let c = sha_crypt::<Sha512>(password.as_bytes(), salt.as_bytes(), 64);

    let mut out = String::with_capacity(86);
    b64_from_24bit(c[0], c[21], c[42], 4, &mut out);
    b64_from_24bit(c[22], c[43], c[1], 4, &mut out);
    b64_from_24bit(c[44], c[2], c[23], 4, &mut out);
    b64_from_24bit(c[3], c[24], c[45], 4, &mut out);
    b64_from_24bit(c[25], c[46], c[4], 4, &mut out);
    b64_from_24bit(c[47], c[5], c[26], 4, &mut out);
    b64_from_24bit(c[6], c[27], c[48], 4, &mut out);
    b64_from_24bit(c[28], c[49], c[7], 4, &mut out);
    b64_from_24bit(c[50], c[8], c[29], 4, &mut out);
    b64_from_24bit(c[9], c[30], c[51], 4, &mut out);
    b64_from_24bit(c[31], c[52], c[10], 4, &mut out);
    b64_from_24bit(c[53], c[11], c[32], 4, &mut out);
    b64_from_24bit(c[12], c[33], c[54], 4, &mut out);
    b64_from_24bit(c[34], c[55], c[13], 4, &mut out);
    b64_from_24bit(c[56], c[14], c[35], 4, &mut out);
    b64_from_24bit(c[15], c[36], c[57], 4, &mut out);
    b64_from_24bit(c[37], c[58], c[16], 4, &mut out);
    b64_from_24bit(c[59], c[17], c[38], 4, &mut out);
    b64_from_24bit(c[18], c[39], c[60], 4, &mut out);
    b64_from_24bit(c[40], c[61], c[19], 4, &mut out);
    b64_from_24bit(c[62], c[20], c[41], 4, &mut out);
    b64_from_24bit(0, 0, c[63], 2, &mut out);

    format!("$6${}${}", salt, out)
}

/// The shared body of the SHA-crypt algorithm; `block` is the digest size.
fn sha_crypt<D: Digest>(pw: &[u8], salt: &[u8], block: usize) -> Vec<u8> {
    let mut a = D::new();
    a.update(pw);
    a.update(salt);

    let mut b = D::new();
    b.update(pw);
    b.update(salt);
    b.update(pw);
    let b = b.finalize();

    let mut cnt = pw.len();
    while cnt > block {
        a.update(&b);
        cnt -= block;
    }
    a.update(&b[..cnt]);

    let mut cnt = pw.len();
    while cnt > 0 {
        if cnt & 1 != 0 {
            a.update(&b);
        } else {
            a.update(pw);
        }
        cnt >>= 1;
    }
    let a = a.finalize().to_vec();

    let mut dp = D::new();
    for _ in 0..pw.len() {
        dp.update(pw);
    }
    let dp = dp.finalize();
    let p: Vec<u8> = dp.iter().copied().cycle().take(pw.len()).collect();

    let mut ds = D::new();
    for _ in 0..(16 + a[0] as usize) {
        ds.update(salt);
    }
    let ds = ds.finalize();
    let s: Vec<u8> = ds.iter().copied().cycle().take(salt.len()).collect();

    let mut c = a;
    for i in 0..SHA_ROUNDS {
        let mut ctx = D::new();
        if i & 1 != 0 {
            ctx.update(&p);
        } else {
            ctx.update(&c);
        }
        if i % 3 != 0 {
            ctx.update(&s);
        }
        if i % 7 != 0 {
            ctx.update(&p);
        }
        if i & 1 != 0 {
            ctx.update(&c);
        } else {
            ctx.update(&p);
        }
        c = ctx.finalize().to_vec();
    }
    c
}

/// Emits `n` characters encoding the 24-bit group (b2 << 16 | b1 << 8 | b0),
/// low six bits first.
fn b64_from_24bit(b2: u8, b1: u8, b0: u8, n: usize, out: &mut String) {
    let mut w = ((b2 as u32) << 16) | ((b1 as u32) << 8) | (b0 as u32);
    for _ in 0..n {
        out.push(ITOA64[(w & 0x3f) as usize] as char);
        w >>= 6;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Reference vectors from the published algorithm descriptions.
    #[test]
    fn sha256_reference_vector() {
        assert_eq!(
            sha256_crypt_salted("Hello world!", "saltstring"),
            "$5$saltstring$5B8vYYiY.CVt1RlTTf8KbXBH3hsxY/GNooZaBBGWEc5"
        );
    }

    #[test]
    fn sha512_reference_vector() {
        assert_eq!(
            sha512_crypt_salted("Hello world!", "saltstring"),
            "$6$saltstring$svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl/O817G3uBnIFNjnQJuesI68u4OTLiBFdcbYEdFCoEOfaS35inz1"
        );
    }

    #[test]
    fn md5_reference_vector() {
        // MD5-crypt truncates the salt to eight characters.
        assert_eq!(
            md5_crypt_salted("Hello world!", "saltstring"),
            "$1$saltstri$YMyguxXMBpd2TEZ.vS/3q1"
        );
    }

    #[test]
    fn salt_stops_at_dollar() {
        let full = sha512_crypt_salted("secret", "abcdef");
        let with_tail = sha512_crypt_salted("secret", "abcdef$ignored");
        assert_eq!(full, with_tail);
    }

    #[test]
    fn hashes_are_deterministic_per_salt() {
        assert_eq!(
            sha256_crypt_salted("pw", "somesalt"),
            sha256_crypt_salted("pw", "somesalt")
        );
        assert_ne!(
            sha256_crypt_salted("pw", "somesalt"),
            sha256_crypt_salted("pw", "othersalt")
        );
    }

    #[test]
    fn random_salt_uses_crypt_alphabet() {
        let salt = random_salt(16);
        assert_eq!(salt.len(), 16);
        assert!(salt.bytes().all(|b| ITOA64.contains(&b)));
    }

    #[test]
    fn random_salt_output_format() {
        let hash = sha512_crypt("secret");
        let mut parts = hash.splitn(4, '$');
        assert_eq!(parts.next(), Some(""));
        assert_eq!(parts.next(), Some("6"));
        assert_eq!(parts.next().unwrap().len(), 16);
        assert_eq!(parts.next().unwrap().len(), 86);
    }
}
