//! Discovery filtering.
//!
//! A raw token list is compiled once per scan start into a `ScanFilterSpec`;
//! classification of each sighting is then a pure function of the event and
//! the compiled spec, with no per-peer state.

use log::debug;
use smallvec::SmallVec;

use crate::transport::ScannedPeer;

/// Token prefix marking a manufacturer-data suffix filter.
const MFR_PREFIX: &str = "MFR:";

/// Compiled filter for one scan session. Immutable for its duration.
#[derive(Debug, Clone, Default)]
pub struct ScanFilterSpec {
   /// Lowercased name substring; `None` leaves the name category open.
   name: Option<String>,
   /// Byte suffixes matched against manufacturer-data payload tails.
   suffixes: Vec<SmallVec<[u8; 8]>>,
}

impl ScanFilterSpec {
   /// Compiles raw tokens: `MFR:<hex>` adds a byte suffix, anything else
   /// becomes the (last-wins) name substring. Malformed hex tokens are
   /// dropped silently and never abort compilation.
   pub fn compile(tokens: &[String]) -> Self {
      let mut spec = Self::default();

      for token in tokens {
         if let Some(hex_str) = token.strip_prefix(MFR_PREFIX) {
            match hex::decode(hex_str) {
               Ok(bytes) if !bytes.is_empty() => {
                  spec.suffixes.push(SmallVec::from_vec(bytes));
               },
               Ok(_) => {
                  debug!("Empty manufacturer filter token ignored");
               },
               Err(e) => {
                  debug!("Dropping malformed filter token {token:?}: {e}");
               },
            }
         } else {
            spec.name = Some(token.to_lowercase());
         }
      }

      spec
   }

   /// Whether every category is open (all sightings match).
   pub fn is_open(&self) -> bool {
      self.name.is_none() && self.suffixes.is_empty()
   }

   /// Classifies one sighting. Absent filter categories auto-match.
   pub fn matches(&self, peer: &ScannedPeer) -> bool {
      self.name_matches(peer) && self.suffix_matches(peer)
   }

   fn name_matches(&self, peer: &ScannedPeer) -> bool {
      let Some(filter) = &self.name else {
         return true;
      };
      match &peer.name {
         Some(name) => name.to_lowercase().contains(filter.as_str()),
         // A nameless sighting cannot contain the substring.
         None => false,
      }
   }

   fn suffix_matches(&self, peer: &ScannedPeer) -> bool {
      if self.suffixes.is_empty() {
         return true;
      }
      peer
         .manufacturer_data
         .values()
         .any(|payload| self.suffixes.iter().any(|suffix| payload.ends_with(suffix)))
   }
}
