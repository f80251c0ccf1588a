mod events;

pub use events::{
    ApprovalPayload, HealthPayload, PreparedTurn, StreamEvent, StreamToken, ToolCall,
    ToolCallStatus, ToolDescriptor, ToolResultPayload, TurnInput,
};
