//! Artifact kinds and the fixed fan-out orderings.

use serde::{Deserialize, Serialize};

/// One sync-able artifact type on the authoring service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Asset,
    Content,
    ContentType,
    Category,
    Layout,
    LayoutMapping,
    PublishingSource,
    Rendition,
    PublishingProfile,
    SiteRevision,
    PublishingJob,
    ImageProfile,
    PublishingSite,
}

/// Kind execution order for pull, chosen so referenced artifacts land
/// before the artifacts that reference them.
pub const PULL_ORDER: [ArtifactKind; 12] = [
    ArtifactKind::PublishingSource,
    ArtifactKind::Category,
    ArtifactKind::Asset,
    ArtifactKind::ImageProfile,
    ArtifactKind::ContentType,
    ArtifactKind::Content,
    ArtifactKind::Layout,
    ArtifactKind::LayoutMapping,
    ArtifactKind::Rendition,
    ArtifactKind::PublishingProfile,
    ArtifactKind::SiteRevision,
    ArtifactKind::PublishingSite,
];

/// Kind execution order for push: the reverse of [`PULL_ORDER`].
pub const PUSH_ORDER: [ArtifactKind; 12] = [
    ArtifactKind::PublishingSite,
    ArtifactKind::SiteRevision,
    ArtifactKind::PublishingProfile,
    ArtifactKind::Rendition,
    ArtifactKind::LayoutMapping,
    ArtifactKind::Layout,
    ArtifactKind::Content,
    ArtifactKind::ContentType,
    ArtifactKind::ImageProfile,
    ArtifactKind::Asset,
    ArtifactKind::Category,
    ArtifactKind::PublishingSource,
];

impl ArtifactKind {
    /// Stable name used in messages, timestamp maps, and CLI selection.
    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::Asset => "asset",
            ArtifactKind::Content => "content",
            ArtifactKind::ContentType => "content-type",
            ArtifactKind::Category => "category",
            ArtifactKind::Layout => "layout",
            ArtifactKind::LayoutMapping => "layout-mapping",
            ArtifactKind::PublishingSource => "publishing-source",
            ArtifactKind::Rendition => "rendition",
            ArtifactKind::PublishingProfile => "publishing-profile",
            ArtifactKind::SiteRevision => "site-revision",
            ArtifactKind::PublishingJob => "publishing-job",
            ArtifactKind::ImageProfile => "image-profile",
            ArtifactKind::PublishingSite => "publishing-site",
        }
    }

    /// Path segment under `/authoring/v1/` for this kind.
    pub fn api_segment(self) -> &'static str {
        match self {
            ArtifactKind::Asset => "assets",
            ArtifactKind::Content => "content",
            ArtifactKind::ContentType => "content-types",
            ArtifactKind::Category => "categories",
            ArtifactKind::Layout => "layouts",
            ArtifactKind::LayoutMapping => "layout-mappings",
            ArtifactKind::PublishingSource => "publishing-sources",
            ArtifactKind::Rendition => "renditions",
            ArtifactKind::PublishingProfile => "publishing-profiles",
            ArtifactKind::SiteRevision => "site-revisions",
            ArtifactKind::PublishingJob => "publishing-jobs",
            ArtifactKind::ImageProfile => "image-profiles",
            ArtifactKind::PublishingSite => "sites",
        }
    }

    /// Directory name under the working root where this kind is stored.
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Asset => "assets",
            other => other.api_segment(),
        }
    }

    /// Binary kinds carry their content in a separate resource blob.
    pub fn is_binary(self) -> bool {
        matches!(self, ArtifactKind::Asset)
    }

    /// Kinds without a revision token are updated with POST instead of PUT.
    pub fn has_rev(self) -> bool {
        !matches!(self, ArtifactKind::Rendition | ArtifactKind::PublishingJob)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        PULL_ORDER
            .iter()
            .copied()
            .chain([ArtifactKind::PublishingJob])
            .find(|k| k.label() == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_order_is_reverse_of_pull_order() {
        let mut reversed = PULL_ORDER;
        reversed.reverse();
        assert_eq!(reversed, PUSH_ORDER);
    }

    #[test]
    fn every_kind_has_a_round_tripping_label() {
        for kind in PULL_ORDER.iter().copied().chain([ArtifactKind::PublishingJob]) {
            assert_eq!(ArtifactKind::from_label(kind.label()), Some(kind));
        }
    }

    #[test]
    fn only_assets_are_binary() {
        assert!(ArtifactKind::Asset.is_binary());
        assert!(!ArtifactKind::Content.is_binary());
        assert!(!ArtifactKind::Rendition.is_binary());
    }

    #[test]
    fn rev_less_kinds() {
        assert!(!ArtifactKind::Rendition.has_rev());
        assert!(!ArtifactKind::PublishingJob.has_rev());
        assert!(ArtifactKind::Content.has_rev());
        assert!(ArtifactKind::Asset.has_rev());
    }
}
