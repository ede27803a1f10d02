//! Header names for both conventions.

/// MassTransit header names.
pub mod masstransit {
    pub const REASON: &str = "MT-Reason";
    pub const FAULT_REASON: &str = "fault";

    pub const MESSAGE_ID: &str = "MessageId";
    pub const CONVERSATION_ID: &str = "ConversationId";
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const MESSAGE_TYPE: &str = "MT-MessageType";
    pub const SOURCE_ADDRESS: &str = "MT-Source-Address";
    pub const SENT_TIME: &str = "MT-Transport-SentTime";
    pub const EXPIRATION_TIME: &str = "MT-Expiration-Time";
    pub const HOST_INFO: &str = "MT-Host-Info";
    pub const HOST_MACHINE_NAME: &str = "MT-Host-MachineName";

    pub const FAULT_INPUT_ADDRESS: &str = "MT-Fault-InputAddress";
    pub const FAULT_EXCEPTION_TYPE: &str = "MT-Fault-ExceptionType";
    pub const FAULT_MESSAGE: &str = "MT-Fault-Message";
    pub const FAULT_STACK_TRACE: &str = "MT-Fault-StackTrace";
    pub const FAULT_TIMESTAMP: &str = "MT-Fault-Timestamp";
    pub const FAULT_RETRY_COUNT: &str = "MT-Fault-RetryCount";

    pub const ENVELOPE_CONTENT_TYPE: &str = "application/vnd.masstransit+json";
    pub const JSON_CONTENT_TYPE: &str = "application/json";
}

/// NServiceBus header names understood by ServiceControl.
pub mod nservicebus {
    pub const PREFIX: &str = "NServiceBus.";

    pub const MESSAGE_ID: &str = "NServiceBus.MessageId";
    pub const MESSAGE_INTENT: &str = "NServiceBus.MessageIntent";
    pub const CONTENT_TYPE: &str = "NServiceBus.ContentType";
    pub const ENCLOSED_MESSAGE_TYPES: &str = "NServiceBus.EnclosedMessageTypes";
    pub const TIME_SENT: &str = "NServiceBus.TimeSent";
    pub const CONVERSATION_ID: &str = "NServiceBus.ConversationId";
    pub const CORRELATION_ID: &str = "NServiceBus.CorrelationId";
    pub const TIME_TO_BE_RECEIVED: &str = "NServiceBus.TimeToBeReceived";
    pub const ORIGINATING_ENDPOINT: &str = "NServiceBus.OriginatingEndpoint";
    pub const ORIGINATING_MACHINE: &str = "NServiceBus.OriginatingMachine";
    pub const PROCESSING_ENDPOINT: &str = "NServiceBus.ProcessingEndpoint";
    pub const PROCESSING_MACHINE: &str = "NServiceBus.ProcessingMachine";
    pub const DELAYED_RETRIES: &str = "NServiceBus.Retries";
    pub const FAILED_QUEUE: &str = "NServiceBus.FailedQ";
    pub const TIME_OF_FAILURE: &str = "NServiceBus.TimeOfFailure";
    pub const EXCEPTION_TYPE: &str = "NServiceBus.ExceptionInfo.ExceptionType";
    pub const EXCEPTION_MESSAGE: &str = "NServiceBus.ExceptionInfo.Message";
    pub const EXCEPTION_STACK_TRACE: &str = "NServiceBus.ExceptionInfo.StackTrace";
}

/// ServiceControl header names.
pub mod servicecontrol {
    pub const PREFIX: &str = "ServiceControl.";

    pub const RETRY_TO: &str = "ServiceControl.RetryTo";
    pub const TARGET_ENDPOINT_ADDRESS: &str = "ServiceControl.TargetEndpointAddress";
    pub const RETRY_ACKNOWLEDGEMENT_QUEUE: &str = "ServiceControl.Retry.AcknowledgementQueue";
    pub const RETRY_UNIQUE_MESSAGE_ID: &str = "ServiceControl.Retry.UniqueMessageId";
}
