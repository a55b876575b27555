//! Merkle root over transaction leaves
//!
//! The block header commits to its ordered transaction set through this
//! root, so reordering, swapping or re-signing transactions changes the
//! block hash.

use super::hash::sha256;

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Vec<u8>]) -> Vec<u8> {
    if hashes.is_empty() {
        return sha256(b"");
    }

    let mut current_level: Vec<Vec<u8>> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| {
                let mut data = chunk[0].clone();
                // Duplicate the last hash on odd levels
                data.extend_from_slice(chunk.get(1).unwrap_or(&chunk[0]));
                sha256(&data)
            })
            .collect();
    }

    current_level.remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![sha256(b"tx1")];
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = sha256(b"tx1");
        let hash2 = sha256(b"tx2");
        let root = calculate_merkle_root(&[hash1.clone(), hash2.clone()]);

        let mut expected = hash1;
        expected.extend_from_slice(&hash2);
        assert_eq!(root, sha256(&expected));
    }

    #[test]
    fn test_merkle_root_order_matters() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_ne!(
            calculate_merkle_root(&[a.clone(), b.clone()]),
            calculate_merkle_root(&[b, a])
        );
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(calculate_merkle_root(&[]), sha256(b""));
    }
}
