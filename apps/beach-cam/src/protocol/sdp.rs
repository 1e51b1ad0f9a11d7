//! Minimal SDP inspection. Only the media-section bookkeeping needed to tag
//! candidates is implemented; the descriptions themselves stay opaque.

/// `(sdpMid, sdpMLineIndex)` of one media section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTag {
    pub mid: String,
    pub mline_index: u16,
}

impl Default for MediaTag {
    fn default() -> Self {
        Self {
            mid: "0".to_string(),
            mline_index: 0,
        }
    }
}

/// A candidate line lifted out of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpCandidate {
    /// Attribute value including the `candidate:` prefix.
    pub candidate: String,
    pub tag: MediaTag,
}

/// Tag of the first media section, or `None` when the description has none.
pub fn media_tag(sdp: &str) -> Option<MediaTag> {
    sections(sdp).into_iter().next().map(|section| section.tag)
}

/// Every `a=candidate:` line, tagged with the section it appeared in.
pub fn extract_candidates(sdp: &str) -> Vec<SdpCandidate> {
    sections(sdp)
        .into_iter()
        .flat_map(|section| {
            let tag = section.tag;
            section
                .candidates
                .into_iter()
                .map(move |candidate| SdpCandidate {
                    candidate,
                    tag: tag.clone(),
                })
        })
        .collect()
}

struct Section {
    tag: MediaTag,
    candidates: Vec<String>,
}

fn sections(sdp: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    for line in sdp.lines().map(str::trim) {
        if line.starts_with("m=") {
            let index = sections.len() as u16;
            sections.push(Section {
                tag: MediaTag {
                    mid: index.to_string(),
                    mline_index: index,
                },
                candidates: Vec::new(),
            });
            continue;
        }
        let Some(current) = sections.last_mut() else {
            continue;
        };
        if let Some(mid) = line.strip_prefix("a=mid:") {
            current.tag.mid = mid.to_string();
        } else if let Some(candidate) = line.strip_prefix("a=") {
            if candidate.starts_with("candidate:") {
                current.candidates.push(candidate.to_string());
            }
        }
    }
    sections
}
