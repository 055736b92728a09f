use serde::{Deserialize, Serialize};

/// Numeric tensor carried between stages. The client never looks inside it.
pub type Payload = Vec<f32>;

/// Result of a single stage call, handed to its continuation exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Payload),
    /// The service reported a failure, the send failed, or the connection dropped.
    Unavailable { reason: String },
    /// No response arrived within the request timeout.
    Timeout,
}

impl Outcome {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Outcome::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// A batch of inputs bound for one service, one id per input.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub service: String,
    pub ids: Vec<u64>,
    pub inputs: Vec<Payload>,
}

impl RequestFrame {
    pub fn single(service: impl Into<String>, id: u64, input: Payload) -> Self {
        RequestFrame {
            service: service.into(),
            ids: vec![id],
            inputs: vec![input],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Unavailable,
}

/// Response to a [`RequestFrame`]: the same ids, one output per id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub status: ResponseStatus,
    pub ids: Vec<u64>,
    pub outputs: Vec<Payload>,
}

impl ResponseFrame {
    pub fn ok(ids: Vec<u64>, outputs: Vec<Payload>) -> Self {
        ResponseFrame {
            status: ResponseStatus::Ok,
            ids,
            outputs,
        }
    }

    pub fn unavailable(ids: Vec<u64>) -> Self {
        ResponseFrame {
            status: ResponseStatus::Unavailable,
            ids,
            outputs: Vec::new(),
        }
    }

    /// Split the frame into one outcome per id. Ids without a matching output
    /// are reported unavailable.
    pub fn into_outcomes(self) -> Vec<(u64, Outcome)> {
        match self.status {
            ResponseStatus::Unavailable => self
                .ids
                .into_iter()
                .map(|id| (id, Outcome::unavailable("service reported unavailable")))
                .collect(),
            ResponseStatus::Ok => {
                let mut outputs = self.outputs.into_iter();
                self.ids
                    .into_iter()
                    .map(|id| match outputs.next() {
                        Some(output) => (id, Outcome::Success(output)),
                        None => (id, Outcome::unavailable("response is missing an output")),
                    })
                    .collect()
            }
        }
    }
}

/// JSON body of `POST /predict/{service}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub ids: Vec<u64>,
    pub inputs: Vec<Payload>,
}

/// JSON body returned by `POST /predict/{service}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub ids: Vec<u64>,
    pub outputs: Vec<Payload>,
}

impl From<PredictResponse> for ResponseFrame {
    fn from(resp: PredictResponse) -> Self {
        ResponseFrame::ok(resp.ids, resp.outputs)
    }
}
