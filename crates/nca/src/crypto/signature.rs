use crate::crypto::RsaModulus;
use rsa::{BigUint, Pss, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Public exponent used by every NCA main-signature key generation.
pub const MAIN_SIGNATURE_PUBLIC_EXPONENT: u32 = 0x010001;

/// RSA-2048-PSS-SHA256 check over the 0x200-byte signed header area.
///
/// Returns a plain pass/fail; callers record the outcome instead of treating
/// a failure as fatal.
pub fn verify_main_signature(modulus: &RsaModulus, message: &[u8], signature: &[u8]) -> bool {
    let n = BigUint::from_bytes_be(&modulus.0 .0);
    let e = BigUint::from(MAIN_SIGNATURE_PUBLIC_EXPONENT);

    let key = match RsaPublicKey::new(n, e) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let digest = Sha256::digest(message);
    key.verify(Pss::new::<Sha256>(), &digest, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hexstring::HexData;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    #[test]
    fn pss_signature_pass_and_fail() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let mut modulus = [0u8; 0x100];
        modulus.copy_from_slice(&private_key.n().to_bytes_be());
        let modulus = RsaModulus(HexData(modulus));

        let message = b"signed header area";
        let digest = Sha256::digest(message);
        let signature = private_key
            .sign_with_rng(&mut rng, Pss::new::<Sha256>(), &digest)
            .unwrap();

        assert!(verify_main_signature(&modulus, message, &signature));
        assert!(!verify_main_signature(&modulus, b"tampered", &signature));
    }
}
