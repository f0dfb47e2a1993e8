//! Interface to the product repository.
//!
//! The repository persists received products and serves reads; its
//! implementation lives outside the P2P core. The publisher manager reads
//! from it to answer peer requests; the subscriber manager writes every
//! delivered item into it and relays notices only for items it newly
//! accepted.

use crate::product::{DataSeg, DataSegId, ProdIndex, ProdInfo};

/// Store of data-products, keyed by product index and segment id.
///
/// Implementations are shared across peer workers and must be thread-safe.
pub trait Repository: Send + Sync + 'static {
    /// Looks up a product's information.
    fn get_prod_info(&self, index: ProdIndex) -> Option<ProdInfo>;

    /// Looks up a data segment.
    fn get_data_seg(&self, id: DataSegId) -> Option<DataSeg>;

    /// Stores product information. Returns whether it was newly accepted
    /// (false for a duplicate).
    fn store_prod_info(&self, info: ProdInfo) -> bool;

    /// Stores a data segment. Returns whether it was newly accepted.
    fn store_data_seg(&self, seg: DataSeg) -> bool;

    /// Whether the product's information and every segment are present.
    fn is_complete(&self, index: ProdIndex) -> bool;
}
