// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Discovery of which archive, if any, holds a file.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use ember_core::io::{CompressionInfo, RequestPath};

/// Something that can answer "do you hold this file?", typically a mounted archive.
pub trait CompressionProvider: Send + Sync {
    /// A name for diagnostics.
    fn name(&self) -> &str;

    /// Describes `path` if this provider holds it.
    fn find_compression_info(&self, path: &RequestPath) -> Option<CompressionInfo>;
}

/// Identifies a connection to the [`CompressionBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

/// Broadcasts lookups to every connected [`CompressionProvider`].
///
/// Providers are asked in connection order and the first one that claims a
/// path wins.
#[derive(Default)]
pub struct CompressionBus {
    providers: RwLock<Vec<(ProviderId, Arc<dyn CompressionProvider>)>>,
    next_id: AtomicU64,
}

impl CompressionBus {
    /// Creates a bus with no providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a provider.
    pub fn connect(&self, provider: Arc<dyn CompressionProvider>) -> ProviderId {
        let id = ProviderId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::info!("Compression provider '{}' connected.", provider.name());
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, provider));
        id
    }

    /// Disconnects a provider. Returns `false` if it was not connected.
    pub fn disconnect(&self, id: ProviderId) -> bool {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match providers.iter().position(|(connected, _)| *connected == id) {
            Some(index) => {
                let (_, provider) = providers.remove(index);
                log::info!("Compression provider '{}' disconnected.", provider.name());
                true
            }
            None => false,
        }
    }

    /// The number of connected providers.
    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no provider is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks the providers about `path`; `None` means no provider holds it.
    pub fn find_compression_info(&self, path: &RequestPath) -> Option<CompressionInfo> {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        providers.iter().find_map(|(_, provider)| {
            let info = provider.find_compression_info(path)?;
            log::trace!(
                "'{}' found in '{}' ({})",
                path.absolute_path(),
                provider.name(),
                info.archive_filename.absolute_path()
            );
            Some(info)
        })
    }
}

impl fmt::Debug for CompressionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_list()
            .entries(providers.iter().map(|(_, provider)| provider.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        name: String,
        claims: &'static str,
        offset: u64,
    }

    impl CompressionProvider for FixedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn find_compression_info(&self, path: &RequestPath) -> Option<CompressionInfo> {
            (path.absolute_path() == self.claims).then(|| CompressionInfo {
                archive_filename: RequestPath::from_absolute(format!("/{}.pak", self.name)),
                offset: self.offset,
                ..Default::default()
            })
        }
    }

    fn provider(name: &str, claims: &'static str, offset: u64) -> Arc<dyn CompressionProvider> {
        Arc::new(FixedProvider {
            name: name.to_owned(),
            claims,
            offset,
        })
    }

    #[test]
    fn test_first_claiming_provider_wins() {
        let bus = CompressionBus::new();
        bus.connect(provider("a", "/x.bin", 1));
        let second = bus.connect(provider("b", "/y.bin", 2));
        bus.connect(provider("c", "/y.bin", 3));

        let path = RequestPath::from_absolute("/y.bin");
        assert_eq!(bus.find_compression_info(&path).unwrap().offset, 2);
        assert!(bus
            .find_compression_info(&RequestPath::from_absolute("/z.bin"))
            .is_none());

        assert!(bus.disconnect(second));
        assert!(!bus.disconnect(second));
        assert_eq!(bus.find_compression_info(&path).unwrap().offset, 3);
        assert_eq!(bus.len(), 2);
    }
}
