//! Family signature tables
//!
//! Which vendor/product ids belong to which family, and which video
//! interfaces a camera must expose, are data rather than code so they can
//! be extended from the configuration file.

use serde::{Deserialize, Serialize};

/// Intel's USB vendor id
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// One known product of a family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: u16,
    pub name: String,
}

impl Product {
    pub fn new(product_id: u16, name: impl Into<String>) -> Self {
        Self {
            product_id,
            name: name.into(),
        }
    }
}

/// Signature a device group must match to belong to a family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySignature {
    pub vendor_id: u16,
    /// Video interface numbers (`mi`) that must all be present
    #[serde(default)]
    pub required_video_interfaces: Vec<u8>,
    /// Video interface numbers reported when present
    #[serde(default)]
    pub optional_video_interfaces: Vec<u8>,
    pub products: Vec<Product>,
}

impl FamilySignature {
    /// Whether `vendor_id:product_id` belongs to this family
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        vendor_id == self.vendor_id && self.products.iter().any(|p| p.product_id == product_id)
    }

    /// Marketing name of a product, if known
    pub fn product_name(&self, product_id: u16) -> Option<&str> {
        self.products
            .iter()
            .find(|p| p.product_id == product_id)
            .map(|p| p.name.as_str())
    }
}

/// Signatures of every known family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyTable {
    pub sr300: FamilySignature,
    pub ds5: FamilySignature,
    pub recovery: FamilySignature,
}

impl Default for FamilyTable {
    fn default() -> Self {
        Self {
            sr300: FamilySignature {
                vendor_id: INTEL_VENDOR_ID,
                // color (mi 0) and depth (mi 2)
                required_video_interfaces: vec![0, 2],
                optional_video_interfaces: Vec::new(),
                products: vec![Product::new(0x0AA5, "Intel RealSense SR300")],
            },
            ds5: FamilySignature {
                vendor_id: INTEL_VENDOR_ID,
                // depth (mi 0); color (mi 3) only on RGB models
                required_video_interfaces: vec![0],
                optional_video_interfaces: vec![3],
                products: vec![
                    Product::new(0x0AD1, "Intel RealSense D400"),
                    Product::new(0x0AD2, "Intel RealSense D410"),
                    Product::new(0x0AD3, "Intel RealSense D415"),
                    Product::new(0x0AD4, "Intel RealSense D430"),
                    Product::new(0x0AD5, "Intel RealSense D430 MM"),
                    Product::new(0x0AF6, "Intel RealSense D420"),
                    Product::new(0x0AFE, "Intel RealSense D420 MM"),
                    Product::new(0x0AFF, "Intel RealSense D410 MM"),
                    Product::new(0x0B00, "Intel RealSense D400 MM"),
                    Product::new(0x0B01, "Intel RealSense D430 MM RGB"),
                    Product::new(0x0B03, "Intel RealSense D460"),
                    Product::new(0x0B07, "Intel RealSense D435"),
                ],
            },
            recovery: FamilySignature {
                vendor_id: INTEL_VENDOR_ID,
                required_video_interfaces: Vec::new(),
                optional_video_interfaces: Vec::new(),
                products: vec![
                    Product::new(0x0ADB, "Intel RealSense D4xx Recovery"),
                    Product::new(0x0AB3, "Intel RealSense Recovery"),
                ],
            },
        }
    }
}
