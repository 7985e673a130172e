//! Display identities handed to participants of a room.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name and cursor color shown to other participants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub color: String,
}

/// Name used once the palette is exhausted; it may repeat within a room.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// The fixed palette of `(name, color)` pairs.
pub const PALETTE: [(&str, &str); 20] = [
    ("Snugglepup", "#F6C6B4"),
    ("Fluffaroo", "#C3E0E5"),
    ("Wiggletail", "#D9B2FF"),
    ("Bunnykins", "#FFDDD2"),
    ("Snickerdog", "#FFDCA9"),
    ("Whiskerly", "#A3D2CA"),
    ("Cuddlemeow", "#E8DFF5"),
    ("Nibblebun", "#FFC6C7"),
    ("Fuzzykins", "#B2EBF2"),
    ("Pompaws", "#FFD6E8"),
    ("Meowster", "#C6D8FF"),
    ("Waddlewoo", "#FFF3B0"),
    ("Snugglefox", "#FFB997"),
    ("Chirplee", "#FFDAC1"),
    ("Muffinpup", "#E4C1F9"),
    ("Hootsie", "#9AD1D4"),
    ("Barklebee", "#FFABAB"),
    ("Tailyboo", "#FFD6A5"),
    ("Ruffster", "#FF677D"),
    ("Peachpaw", "#FDE2FF"),
];

impl Identity {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// The generic fallback with a random color.
    pub fn anonymous<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let color: u32 = rng.gen_range(0..=0xFF_FFFF);
        Self::new(ANONYMOUS_NAME, format!("#{color:06X}"))
    }

    pub fn is_anonymous(&self) -> bool {
        self.name == ANONYMOUS_NAME
    }

    /// Pick a palette entry whose name is not in `taken`, falling back to
    /// an anonymous identity when every name is held.
    pub fn choose<R: Rng + ?Sized>(taken: &HashSet<&str>, rng: &mut R) -> Self {
        let free: Vec<&(&str, &str)> = PALETTE
            .iter()
            .filter(|(name, _)| !taken.contains(name))
            .collect();
        match free.choose(rng) {
            Some((name, color)) => Self::new(*name, *color),
            None => Self::anonymous(rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_palette_names_are_unique() {
        let names: HashSet<&str> = PALETTE.iter().map(|(name, _)| *name).collect();
        assert_eq!(names.len(), PALETTE.len());
        assert!(!names.contains(ANONYMOUS_NAME));
    }

    #[test]
    fn test_choose_skips_taken_names() {
        let mut rng = StdRng::seed_from_u64(7);
        let taken: HashSet<&str> = PALETTE.iter().skip(1).map(|(name, _)| *name).collect();
        let identity = Identity::choose(&taken, &mut rng);
        assert_eq!(identity, Identity::new("Snugglepup", "#F6C6B4"));
    }

    #[test]
    fn test_exhausted_palette_falls_back_to_anonymous() {
        let mut rng = StdRng::seed_from_u64(7);
        let taken: HashSet<&str> = PALETTE.iter().map(|(name, _)| *name).collect();
        let identity = Identity::choose(&taken, &mut rng);
        assert!(identity.is_anonymous());
        assert_eq!(identity.color.len(), 7);
        assert!(identity.color.starts_with('#'));
        assert!(u32::from_str_radix(&identity.color[1..], 16).is_ok());
    }
}
