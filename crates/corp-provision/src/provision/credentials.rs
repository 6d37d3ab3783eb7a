//! Generated login passwords.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%";

/// Shortest password [`generate_password`] produces.
pub const MIN_PASSWORD_LENGTH: usize = 12;

/// Random password over letters, digits and `!@#$%`, drawn from the OS RNG.
///
/// Always contains at least one upper-case letter, lower-case letter, digit
/// and symbol so it satisfies `CHECK_POLICY = ON`. Lengths below
/// [`MIN_PASSWORD_LENGTH`] are raised to it.
pub fn generate_password(length: usize) -> String {
    let length = length.max(MIN_PASSWORD_LENGTH);
    let alphabet: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS].concat();
    let mut rng = OsRng;

    let mut chars: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS]
        .iter()
        .map(|class| pick(class, &mut rng))
        .collect();
    let any = Uniform::from(0..alphabet.len());
    chars.extend((chars.len()..length).map(|_| alphabet[any.sample(&mut rng)]));
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

fn pick(class: &[u8], rng: &mut OsRng) -> u8 {
    class[Uniform::from(0..class.len()).sample(rng)]
}
