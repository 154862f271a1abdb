use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Control messages exchanged as JSON documents between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Ask the peer for a listing. An absent or empty path means the
    /// drive-root view.
    ListRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Listing reply. Entries use the legacy textual encoding
    /// (`[Drive] …` / `[Folder] …` / `[File] … (<size>)`).
    FileList { files: Vec<String>, path: String },
    /// Ask the peer to send `file_name` from its directory `path`, to be
    /// saved under our `save_path`.
    PullRequest {
        file_name: String,
        path: String,
        save_path: String,
    },
}

/// Header announcing a file transfer: `name|size|destDir|checksum`, with the
/// checksum field absent for pull-initiated sends. Raw file bytes follow the
/// header's frame delimiter immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferHeader {
    pub name: String,
    pub size: u64,
    pub dest_dir: String,
    pub checksum: Option<String>,
}

impl TransferHeader {
    pub fn encode(&self) -> String {
        match &self.checksum {
            Some(sum) => format!("{}|{}|{}|{}", self.name, self.size, self.dest_dir, sum),
            None => format!("{}|{}|{}", self.name, self.size, self.dest_dir),
        }
    }

    /// Parse and validate a header received from the peer.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let fields: Vec<&str> = text.split('|').collect();
        let (name, size, dest_dir, checksum) = match fields.as_slice() {
            [name, size, dest] => (*name, *size, *dest, None),
            [name, size, dest, sum] => {
                let sum = if sum.is_empty() {
                    None
                } else {
                    Some(sum.to_string())
                };
                (*name, *size, *dest, sum)
            }
            _ => {
                return Err(CoreError::protocol(format!(
                    "transfer header has {} fields, expected 3 or 4",
                    fields.len()
                )));
            }
        };

        validate_bare_name(name)?;
        let size: u64 = size
            .parse()
            .map_err(|_| CoreError::protocol(format!("invalid file size in header: {size:?}")))?;

        Ok(Self {
            name: name.to_string(),
            size,
            dest_dir: dest_dir.to_string(),
            checksum,
        })
    }
}

/// Reject peer-supplied file names that are empty or could escape the
/// destination directory.
pub fn validate_bare_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::protocol("empty file name"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(CoreError::protocol(format!(
            "file name {name:?} is not a bare name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_wire_shapes() {
        let json = serde_json::to_string(&ControlMessage::ListRequest { path: None }).unwrap();
        assert_eq!(json, r#"{"type":"list_request"}"#);

        let json = serde_json::to_string(&ControlMessage::ListRequest {
            path: Some("/tmp".into()),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"list_request","path":"/tmp"}"#);

        let msg: ControlMessage = serde_json::from_str(
            r#"{"type":"pull_request","file_name":"a.txt","path":"/srv","save_path":"/dl"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::PullRequest {
                file_name: "a.txt".into(),
                path: "/srv".into(),
                save_path: "/dl".into(),
            }
        );
    }

    #[test]
    fn test_file_list_roundtrip() {
        let msg = ControlMessage::FileList {
            files: vec!["[Folder] docs".into(), "[File] a.txt (12 B)".into()],
            path: "/srv".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_header_four_fields() {
        let header = TransferHeader::parse("report.pdf|2048|/home/user/Downloads|abc123").unwrap();
        assert_eq!(header.name, "report.pdf");
        assert_eq!(header.size, 2048);
        assert_eq!(header.dest_dir, "/home/user/Downloads");
        assert_eq!(header.checksum.as_deref(), Some("abc123"));
        assert_eq!(TransferHeader::parse(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_header_three_fields_has_no_checksum() {
        let header = TransferHeader::parse("a.bin|10|/tmp").unwrap();
        assert_eq!(header.checksum, None);
        assert_eq!(header.encode(), "a.bin|10|/tmp");
    }

    #[test]
    fn test_header_empty_checksum_field() {
        let header = TransferHeader::parse("a.bin|10|/tmp|").unwrap();
        assert_eq!(header.checksum, None);
    }

    #[test]
    fn test_header_rejects_bad_size() {
        assert!(TransferHeader::parse("a.bin|-1|/tmp").is_err());
        assert!(TransferHeader::parse("a.bin|ten|/tmp").is_err());
    }

    #[test]
    fn test_header_rejects_traversal_names() {
        assert!(TransferHeader::parse("../evil|10|/tmp").is_err());
        assert!(TransferHeader::parse("sub/evil|10|/tmp").is_err());
        assert!(TransferHeader::parse("..|10|/tmp").is_err());
        assert!(TransferHeader::parse("|10|/tmp").is_err());
    }

    #[test]
    fn test_header_wrong_field_count() {
        assert!(TransferHeader::parse("just-a-name").is_err());
        assert!(TransferHeader::parse("a|1|b|c|d").is_err());
    }
}
