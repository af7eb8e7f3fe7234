use url::form_urlencoded::byte_serialize;

/// Events sent to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// Announce parameters
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Port this peer is listening on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Number of bytes left to download
    pub left: u64,
    pub event: Option<TrackerEvent>,
    /// Number of peers we would like back
    pub numwant: u32,
}

impl TrackerRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: Some(TrackerEvent::Started),
            numwant: 200,
        }
    }

    pub fn with_event(mut self, event: Option<TrackerEvent>) -> Self {
        self.event = event;
        self
    }

    /// Query string for an announce GET.
    ///
    /// The binary fields are percent-encoded by hand; passing them through a
    /// generic parameter encoder would escape the `%` signs a second time.
    pub fn query_string(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            byte_serialize(&self.info_hash).collect::<String>(),
            byte_serialize(&self.peer_id).collect::<String>(),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
            self.numwant,
        );

        if let Some(event) = self.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        query
    }
}
